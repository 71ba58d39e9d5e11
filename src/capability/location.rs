use serde_json::json;
use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
};
use tracing::error;

use super::{DiskLocation, Feature, ModFlag, Owner};
use crate::meta_store::{row, value_as_int, MetaStore};

const ARCHIVE_EXTENSION: &str = "bsa";

/// A mod that lives in its own directory under the managed mods root.
#[derive(Debug)]
pub struct Installed {
    path: PathBuf,
    installation_file: String,
    installed_files: BTreeSet<(i64, i64)>,
    owner: Owner,
}

impl Installed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            installation_file: String::new(),
            installed_files: BTreeSet::new(),
            owner: Owner::default(),
        }
    }

    pub fn add_installed_file(&mut self, mod_id: i64, file_id: i64) {
        self.installed_files.insert((mod_id, file_id));
        self.owner.mark_dirty();
    }

    pub fn installed_files(&self) -> &BTreeSet<(i64, i64)> {
        &self.installed_files
    }

    /// Archive the mod was installed from.
    pub fn installation_file(&self) -> &str {
        &self.installation_file
    }

    pub fn set_installation_file(&mut self, file_name: &str) {
        self.installation_file = file_name.to_string();
        self.owner.mark_dirty();
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    /// Renames the mod directory in place.
    ///
    /// Names that differ only by case go through an intermediate name so
    /// case-insensitive filesystems see a real change.
    pub fn rename_dir(&mut self, new_name: &str) -> io::Result<()> {
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "mod path has no parent"))?;
        let old_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        if old_name == new_name {
            return Ok(());
        }

        let target = parent.join(new_name);
        if old_name.to_lowercase() == new_name.to_lowercase() {
            let mut temp_name = format!("{new_name}_temp");
            while parent.join(&temp_name).exists() {
                temp_name.push('_');
            }
            let temp = parent.join(&temp_name);
            fs::rename(&self.path, &temp)?;
            if let Err(err) = fs::rename(&temp, &target) {
                error!(
                    from = %temp.display(),
                    to = %target.display(),
                    error = %err,
                    "rename to final name failed after intermediate rename"
                );
                let _ = fs::rename(&temp, &self.path);
                return Err(err);
            }
        } else {
            if target.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", target.display()),
                ));
            }
            fs::rename(&self.path, &target)?;
        }

        self.path = target;
        Ok(())
    }
}

impl DiskLocation for Installed {
    fn absolute_path(&self) -> PathBuf {
        self.path.clone()
    }

    fn archives(&self) -> Vec<PathBuf> {
        list_archives(&self.path, None)
    }
}

impl Feature for Installed {
    fn attach(&mut self, owner: Owner) {
        self.owner = owner;
    }

    fn save_meta(&self, store: &mut MetaStore) {
        store.set("installationFile", self.installation_file.as_str());
        let rows = self
            .installed_files
            .iter()
            .map(|(mod_id, file_id)| row(&[("modid", json!(mod_id)), ("fileid", json!(file_id))]))
            .collect();
        store.set_array("installedFiles", rows);
    }

    fn read_meta(&mut self, store: &MetaStore) {
        self.installation_file = store.string("installationFile").unwrap_or_default();
        for entry in store.array("installedFiles") {
            let mod_id = entry.get("modid").and_then(value_as_int).unwrap_or(0);
            let file_id = entry.get("fileid").and_then(value_as_int).unwrap_or(0);
            self.installed_files.insert((mod_id, file_id));
        }
    }
}

/// A plugin that sits directly in the game's data directory.
#[derive(Debug)]
pub struct ForeignInstalled {
    reference_file: PathBuf,
    data_dir: PathBuf,
    archives: Vec<PathBuf>,
}

impl ForeignInstalled {
    pub fn new(data_dir: &Path, plugin_name: &str) -> Self {
        let reference_file = data_dir.join(plugin_name);
        let base_name = Path::new(plugin_name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        let archives = list_archives(data_dir, Some(&base_name));
        Self {
            reference_file,
            data_dir: data_dir.to_path_buf(),
            archives,
        }
    }

    pub fn reference_file(&self) -> &Path {
        &self.reference_file
    }

    /// Files that belong to this plugin even though they sit in the data directory.
    pub fn steal_files(&self) -> Vec<PathBuf> {
        let mut files = self.archives.clone();
        files.push(self.reference_file.clone());
        files
    }
}

impl DiskLocation for ForeignInstalled {
    fn absolute_path(&self) -> PathBuf {
        self.data_dir.clone()
    }

    fn archives(&self) -> Vec<PathBuf> {
        self.archives.clone()
    }
}

impl Feature for ForeignInstalled {}

/// Content directory of a workshop subscription.
#[derive(Debug)]
pub struct SteamInstalled {
    path: PathBuf,
}

impl SteamInstalled {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = match fs::read_dir(&self.path) {
            Ok(entries) => entries.flatten().map(|entry| entry.path()).collect(),
            Err(_) => Vec::new(),
        };
        files.sort();
        files
    }
}

impl DiskLocation for SteamInstalled {
    fn absolute_path(&self) -> PathBuf {
        self.path.clone()
    }

    fn archives(&self) -> Vec<PathBuf> {
        list_archives(&self.path, None)
    }
}

impl Feature for SteamInstalled {}

/// Scratch directory that receives files written while the game runs.
#[derive(Debug)]
pub struct OverwriteLocation {
    path: PathBuf,
}

impl OverwriteLocation {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DiskLocation for OverwriteLocation {
    fn absolute_path(&self) -> PathBuf {
        self.path.clone()
    }

    fn archives(&self) -> Vec<PathBuf> {
        list_archives(&self.path, None)
    }
}

impl Feature for OverwriteLocation {
    fn flags(&self, _origin: &str) -> BTreeSet<ModFlag> {
        BTreeSet::from([ModFlag::Overwrite])
    }
}

fn list_archives(dir: &Path, prefix: Option<&str>) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let prefix = prefix.map(str::to_lowercase);
    let mut archives: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(ARCHIVE_EXTENSION))
                .unwrap_or(false)
        })
        .filter(|path| match &prefix {
            Some(prefix) => path
                .file_name()
                .map(|name| name.to_string_lossy().to_lowercase().starts_with(prefix))
                .unwrap_or(false),
            None => true,
        })
        .collect();
    archives.sort();
    archives
}
