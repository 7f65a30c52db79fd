//! File component selection and remote backup set parsing
//!
//! Component lists are always filtered against a fixed allow-list and
//! returned in the allow-list's canonical order, whatever the input order.

use serde::Serialize;

/// File areas the engine knows how to back up, in canonical order, with display labels
pub const FILE_COMPONENTS: &[(&str, &str)] = &[
    ("config", "Config"),
    ("src", "Source (src)"),
    ("templates", "Templates"),
    ("webroot", "Webroot"),
    ("resources", "Resources"),
    ("plugins", "Plugins"),
    ("uploads", "Uploads"),
    ("www", "www"),
    ("db_files", "db (migrations/seeds)"),
    ("root_files", "Root files (composer/bin/index.php)"),
    ("env_files", "Env files (.env)"),
];

/// Pseudo-component selecting the database in a restore
pub const DATABASE_COMPONENT: &str = "database";

/// Restore components preselected in the UI (everything except env files)
pub const RESTORE_DEFAULT_COMPONENTS: &[&str] = &[
    "database",
    "config",
    "src",
    "templates",
    "webroot",
    "resources",
    "plugins",
    "uploads",
    "www",
    "db_files",
    "root_files",
];

/// All file component keys in canonical order
pub fn file_component_keys() -> Vec<String> {
    FILE_COMPONENTS.iter().map(|(key, _)| key.to_string()).collect()
}

/// Restore allow-list: `database` followed by the file components
pub fn restore_component_keys() -> Vec<String> {
    std::iter::once(DATABASE_COMPONENT.to_string())
        .chain(file_component_keys())
        .collect()
}

fn normalize_against<S: AsRef<str>>(components: &[S], allowed: &[String]) -> Vec<String> {
    let requested: Vec<String> = components
        .iter()
        .map(|c| c.as_ref().trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect();

    allowed
        .iter()
        .filter(|key| requested.iter().any(|r| r == *key))
        .cloned()
        .collect()
}

/// Normalize a backup component selection
pub fn normalize_file_components<S: AsRef<str>>(components: &[S]) -> Vec<String> {
    normalize_against(components, &file_component_keys())
}

/// Normalize a restore component selection (file components plus `database`)
pub fn normalize_restore_components<S: AsRef<str>>(components: &[S]) -> Vec<String> {
    normalize_against(components, &restore_component_keys())
}

/// Resolve the saved comma-separated selection, falling back to every component
pub fn selected_file_components(saved: &str) -> Vec<String> {
    let parts: Vec<&str> = if saved.is_empty() {
        Vec::new()
    } else {
        saved.split(',').collect()
    };

    let normalized = normalize_file_components(&parts);
    if normalized.is_empty() {
        file_component_keys()
    } else {
        normalized
    }
}

/// A remote backup set as reported by the engine's `list-sets` verb
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupSet {
    pub id: String,
    pub components: Vec<String>,
    pub has_db: bool,
}

impl BackupSet {
    /// Human label such as `abc123 (DB + config, uploads)`
    pub fn label(&self) -> String {
        let mut parts = Vec::new();
        if self.has_db {
            parts.push("DB".to_string());
        }
        if !self.components.is_empty() {
            parts.push(self.components.join(", "));
        }

        if parts.is_empty() {
            self.id.clone()
        } else {
            format!("{} ({})", self.id, parts.join(" + "))
        }
    }
}

/// Parse tab-separated `id\tcomponents\thasDb` lines; malformed lines are skipped
pub fn parse_backup_sets(output: &str) -> Vec<BackupSet> {
    let mut sets: Vec<BackupSet> = Vec::new();

    for line in output.trim().lines() {
        if line.trim().is_empty() {
            continue;
        }

        let mut fields = line.split('\t');
        let id = fields.next().unwrap_or("").trim().to_string();
        if id.is_empty() {
            continue;
        }

        let components_csv = fields.next().unwrap_or("");
        let parts: Vec<&str> = components_csv.split(',').collect();
        let has_db = fields.next().unwrap_or("0") == "1";

        let set = BackupSet {
            id,
            components: normalize_file_components(&parts),
            has_db,
        };

        // Later lines win for a repeated id
        match sets.iter_mut().find(|s| s.id == set.id) {
            Some(existing) => *existing = set,
            None => sets.push(set),
        }
    }

    sets
}
