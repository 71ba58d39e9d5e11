use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use crate::meta_store::META_FILE_NAME;

const PLUGIN_EXTENSIONS: &[&str] = &["esp", "esm", "esl"];
const ARCHIVE_EXTENSIONS: &[&str] = &["bsa", "ba2"];
const SCRIPT_EXTENDERS: &[&str] = &["skse", "f4se", "nvse", "obse", "fose"];

/// Directory names a mod may carry at its top level.
const TOP_LEVEL_DIRECTORIES: &[&str] = &[
    "bookart",
    "calientetools",
    "distantland",
    "distantlod",
    "dllplugins",
    "facegen",
    "fonts",
    "icons",
    "interface",
    "lodsettings",
    "materials",
    "mcm",
    "menus",
    "meshes",
    "music",
    "netscriptframework",
    "scripts",
    "seq",
    "shaders",
    "shadersfx",
    "skyproc patchers",
    "sound",
    "splash",
    "strings",
    "textures",
    "tools",
    "trees",
    "video",
    "f4se",
    "fose",
    "nvse",
    "obse",
    "skse",
];

/// File suffixes that make a mod valid on their own.
const TOP_LEVEL_SUFFIXES: &[&str] = &["esp", "esm", "esl", "bsa", "ba2", "modgroups", "ini"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Plugin,
    Texture,
    Mesh,
    Archive,
    Interface,
    Music,
    Sound,
    Script,
    ScriptExtender,
    SkyProc,
    String,
}

impl ContentType {
    pub fn label(self) -> &'static str {
        match self {
            ContentType::Plugin => "Plugins",
            ContentType::Texture => "Textures",
            ContentType::Mesh => "Meshes",
            ContentType::Archive => "BSA",
            ContentType::Interface => "UI Changes",
            ContentType::Music => "Music",
            ContentType::Sound => "Sound Effects",
            ContentType::Script => "Scripts",
            ContentType::ScriptExtender => "Script Extender Plugins",
            ContentType::SkyProc => "SkyProc Tools",
            ContentType::String => "Strings",
        }
    }
}

struct TopLevel {
    /// Lowercased directory name to its name on disk.
    dirs: HashMap<String, String>,
    extensions: HashSet<String>,
}

impl TopLevel {
    fn scan(dir: &Path) -> Self {
        let mut top = TopLevel {
            dirs: HashMap::new(),
            extensions: HashSet::new(),
        };
        let Ok(entries) = fs::read_dir(dir) else {
            return top;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                top.dirs.insert(name.to_lowercase(), name);
            } else if let Some(ext) = path.extension() {
                top.extensions.insert(ext.to_string_lossy().to_lowercase());
            }
        }
        top
    }

    fn has_dir(&self, name: &str) -> bool {
        self.dirs.contains_key(name)
    }

    /// Path of the top-level directory matching `name` in any case.
    fn dir_path(&self, root: &Path, name: &str) -> Option<PathBuf> {
        self.dirs.get(name).map(|on_disk| root.join(on_disk))
    }

    fn has_extension(&self, extensions: &[&str]) -> bool {
        extensions.iter().any(|ext| self.extensions.contains(*ext))
    }
}

/// Content tags for the mod rooted at `dir`, in a stable order.
pub fn detect(dir: &Path) -> Vec<ContentType> {
    let top = TopLevel::scan(dir);
    let mut content = Vec::new();
    if top.has_extension(PLUGIN_EXTENSIONS) {
        content.push(ContentType::Plugin);
    }
    if top.has_extension(ARCHIVE_EXTENSIONS) {
        content.push(ContentType::Archive);
    }
    let extender_plugins = SCRIPT_EXTENDERS.iter().any(|extender| {
        top.dir_path(dir, extender)
            .is_some_and(|path| has_child_dir(&path, "plugins"))
    });
    if extender_plugins {
        content.push(ContentType::ScriptExtender);
    }
    let checks = [
        ("textures", ContentType::Texture),
        ("meshes", ContentType::Mesh),
        ("interface", ContentType::Interface),
        ("menus", ContentType::Interface),
        ("music", ContentType::Music),
        ("sound", ContentType::Sound),
        ("scripts", ContentType::Script),
        ("strings", ContentType::String),
        ("skyproc patchers", ContentType::SkyProc),
    ];
    for (name, kind) in checks {
        if top.has_dir(name) && !content.contains(&kind) {
            content.push(kind);
        }
    }
    content
}

/// True when `dir` holds something the game would load.
pub fn is_valid_mod_dir(dir: &Path) -> bool {
    let top = TopLevel::scan(dir);
    TOP_LEVEL_DIRECTORIES.iter().any(|name| top.has_dir(name))
        || top.has_extension(TOP_LEVEL_SUFFIXES)
}

/// True when `dir` is missing or holds nothing but the metadata file.
pub fn is_empty_dir(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return true;
    };
    entries
        .flatten()
        .all(|entry| entry.file_name() == META_FILE_NAME)
}

fn has_child_dir(dir: &Path, name: &str) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        entry.path().is_dir() && entry.file_name().to_string_lossy().eq_ignore_ascii_case(name)
    })
}
