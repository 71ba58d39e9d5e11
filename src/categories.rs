use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::Path};

pub const CATEGORIES_FILE_NAME: &str = "categories.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub parent_id: i64,
    #[serde(default)]
    pub remote_ids: Vec<i64>,
}

/// User-editable category tree plus the mapping from repository category ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryCatalog {
    categories: Vec<Category>,
    #[serde(skip)]
    by_id: HashMap<i64, usize>,
    #[serde(skip)]
    by_remote: HashMap<i64, i64>,
}

impl CategoryCatalog {
    pub fn new(categories: Vec<Category>) -> Self {
        let mut catalog = Self {
            categories,
            by_id: HashMap::new(),
            by_remote: HashMap::new(),
        };
        catalog.reindex();
        catalog
    }

    /// Loads `categories.json` from `dir`, writing the defaults when missing.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join(CATEGORIES_FILE_NAME);
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read categories")?;
            let mut catalog: CategoryCatalog =
                serde_json::from_str(&raw).context("parse categories")?;
            catalog.reindex();
            return Ok(catalog);
        }

        let catalog = Self::default();
        fs::create_dir_all(dir).context("create categories dir")?;
        let raw = serde_json::to_string_pretty(&catalog).context("serialize categories")?;
        fs::write(&path, raw).context("write categories")?;
        Ok(catalog)
    }

    fn reindex(&mut self) {
        self.by_id.clear();
        self.by_remote.clear();
        for (index, category) in self.categories.iter().enumerate() {
            self.by_id.insert(category.id, index);
            for remote in &category.remote_ids {
                self.by_remote.insert(*remote, category.id);
            }
        }
    }

    pub fn exists(&self, id: i64) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn name(&self, id: i64) -> Option<&str> {
        let index = self.by_id.get(&id)?;
        Some(self.categories[*index].name.as_str())
    }

    pub fn is_descendant_of(&self, id: i64, ancestor: i64) -> bool {
        let mut current = id;
        // Guards against cycles in hand-edited files.
        for _ in 0..self.categories.len() {
            let Some(index) = self.by_id.get(&current) else {
                return false;
            };
            let parent = self.categories[*index].parent_id;
            if parent == ancestor {
                return true;
            }
            if parent == 0 {
                return false;
            }
            current = parent;
        }
        false
    }

    /// Maps a repository category id to a local one; 0 when unmapped.
    pub fn resolve_remote_id(&self, remote_id: i64) -> i64 {
        self.by_remote.get(&remote_id).copied().unwrap_or(0)
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }
}

impl Default for CategoryCatalog {
    fn default() -> Self {
        let defaults = [
            (1, "Animations", 0, vec![4]),
            (2, "Armour", 0, vec![54]),
            (3, "Sound & Music", 0, vec![61]),
            (5, "Clothing", 0, vec![60]),
            (6, "Collectables", 0, vec![92]),
            (28, "Companions", 0, vec![66, 96]),
            (7, "Creatures & Mounts", 0, vec![83, 65]),
            (8, "Factions", 0, vec![25]),
            (9, "Gameplay", 0, vec![24]),
            (10, "Hair", 0, vec![26]),
            (11, "Items", 0, vec![27, 85]),
            (32, "Mercantile", 0, vec![69]),
            (19, "Weapons", 11, vec![55]),
            (36, "Weapon & Armour Sets", 11, vec![37]),
            (12, "Locations", 0, vec![22, 30, 70, 88, 89, 90, 91, 74, 64]),
            (31, "Landscape Changes", 0, vec![58]),
            (4, "Cities", 12, vec![53]),
            (29, "Environment", 0, vec![14]),
            (30, "Immersion", 0, vec![51]),
            (25, "Castles & Mansions", 23, vec![68]),
            (20, "Magic", 0, vec![75]),
            (21, "Models & Textures", 0, vec![29]),
            (33, "Modders resources", 0, vec![18]),
            (13, "NPCs", 0, vec![33]),
            (24, "Bugfixes", 0, vec![95]),
            (35, "Utilities", 0, vec![39]),
            (26, "Cheats", 0, vec![40]),
            (23, "Player Homes", 0, vec![67]),
            (27, "Patches", 0, vec![79, 84]),
            (14, "Quests", 0, vec![35]),
            (16, "Races & Classes", 0, vec![34]),
            (34, "Stealth", 0, vec![77]),
            (17, "UI", 0, vec![42]),
            (18, "Visuals", 0, vec![62]),
        ];
        Self::new(
            defaults
                .into_iter()
                .map(|(id, name, parent_id, remote_ids)| Category {
                    id,
                    name: name.to_string(),
                    parent_id,
                    remote_ids,
                })
                .collect(),
        )
    }
}
