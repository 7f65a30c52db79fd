//! Runtime environment handed to the backup engine
//!
//! Built fresh for every invocation. It carries the repository passphrase and
//! storage secrets, so it is never cached and its `Debug` output is redacted.

use sha2::{Digest, Sha256};

use crate::backup::components::selected_file_components;
use crate::backup::db_env::DbConnection;
use crate::backup::DEFAULT_REGION;
use crate::db::BackupSettings;

/// Variables whose values must never reach logs
const SECRET_KEYS: &[&str] = &["RESTIC_PASSWORD", "AWS_SECRET_ACCESS_KEY", "DB_PASSWORD"];

/// Ordered variable set for one engine invocation
#[derive(Clone, Default, PartialEq)]
pub struct RuntimeEnv {
    vars: Vec<(String, String)>,
}

impl RuntimeEnv {
    /// Set a variable, replacing an existing value in place
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.vars.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl std::fmt::Debug for RuntimeEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.vars {
            if SECRET_KEYS.contains(&key.as_str()) {
                map.entry(key, &"<redacted>");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

/// Bucket and optional prefix of a `bucket[/prefix]` path
pub fn split_backup_path(backup_path: &str) -> (String, Option<String>) {
    let trimmed = backup_path.trim().trim_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, prefix)) if !prefix.is_empty() => {
            (bucket.to_string(), Some(prefix.to_string()))
        }
        Some((bucket, _)) => (bucket.to_string(), None),
        None => (trimmed.to_string(), None),
    }
}

/// Region with the default applied when blank
pub fn normalize_region(region: &str) -> String {
    let region = region.trim();
    if region.is_empty() {
        DEFAULT_REGION.to_string()
    } else {
        region.to_string()
    }
}

/// S3 endpoint of a B2 region
pub fn b2_endpoint(region: &str) -> String {
    format!("https://s3.{}.backblazeb2.com", region)
}

/// Repository locator: `s3:https://s3.<region>.backblazeb2.com/<bucket>[/<prefix>]`
pub fn repository_url(backup_path: &str, region: &str) -> String {
    let (bucket, prefix) = split_backup_path(backup_path);
    let mut url = format!("s3:{}/{}", b2_endpoint(&normalize_region(region)), bucket);
    if let Some(prefix) = prefix {
        url.push('/');
        url.push_str(&prefix);
    }
    url
}

/// Deterministic repository passphrase, hex SHA-256 of `key|path|salt`
pub fn derive_passphrase(application_key: &str, backup_path: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(application_key.as_bytes());
    hasher.update(b"|");
    hasher.update(backup_path.as_bytes());
    hasher.update(b"|");
    hasher.update(salt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// First non-empty candidate with the trailing slash removed
pub fn site_url(base_url: Option<&str>, account_domain: Option<&str>) -> String {
    [base_url, account_domain]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|candidate| !candidate.is_empty())
        .map(|candidate| candidate.trim_end_matches('/').to_string())
        .unwrap_or_default()
}

/// Inputs of the runtime environment that do not come from the settings record
pub struct EnvContext<'a> {
    pub salt: &'a str,
    pub site_url: &'a str,
    pub db: &'a DbConnection,
}

/// Build the full engine environment; callers guarantee the settings carry
/// key id, application key and backup path
pub fn build_runtime_env(settings: &BackupSettings, ctx: &EnvContext<'_>) -> RuntimeEnv {
    let backup_path = settings.backup_path.trim().trim_matches('/').to_string();
    let region = normalize_region(&settings.b2_region);
    let passphrase = derive_passphrase(&settings.b2_application_key, &backup_path, ctx.salt);

    let mut env = RuntimeEnv::default();
    env.set("BACKUP_DRIVER", "native");
    env.set("BACKUP_PATH", backup_path.as_str());
    env.set("RESTIC_REPOSITORY", repository_url(&backup_path, &region));
    env.set("RESTIC_PASSWORD", passphrase);
    env.set("AWS_ACCESS_KEY_ID", settings.b2_key_id.as_str());
    env.set("AWS_SECRET_ACCESS_KEY", settings.b2_application_key.as_str());
    env.set("BACKUP_RETENTION_DAYS", settings.retention_days.to_string());
    env.set(
        "BACKUP_FILE_COMPONENTS",
        selected_file_components(&settings.backup_components).join(","),
    );
    env.set("BACKUP_SITE_URL", ctx.site_url);
    env.set("RESTORE_TARGET_URL", ctx.site_url);
    env.set("DB_HOST", ctx.db.host.as_str());
    env.set("DB_PORT", ctx.db.port.as_str());
    env.set("DB_NAME", ctx.db.database.as_str());
    env.set("DB_USER", ctx.db.username.as_str());
    env.set("DB_PASSWORD", ctx.db.password.as_str());
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BackupSettings {
        BackupSettings {
            b2_key_id: "0041abc".to_string(),
            b2_application_key: "K004secret".to_string(),
            backup_path: "/bucket/sub/dir/".to_string(),
            b2_region: "  ".to_string(),
            backup_components: "uploads,config".to_string(),
            retention_days: 30,
            ..Default::default()
        }
    }

    #[test]
    fn test_repository_url_with_prefix() {
        assert_eq!(
            repository_url("bucket/sub/dir", "us-west-004"),
            "s3:https://s3.us-west-004.backblazeb2.com/bucket/sub/dir"
        );
        assert_eq!(
            repository_url("/bucket/", "eu-central-003"),
            "s3:https://s3.eu-central-003.backblazeb2.com/bucket"
        );
    }

    #[test]
    fn test_split_backup_path() {
        assert_eq!(
            split_backup_path("bucket/a/b"),
            ("bucket".to_string(), Some("a/b".to_string()))
        );
        assert_eq!(split_backup_path("bucket"), ("bucket".to_string(), None));
    }

    #[test]
    fn test_passphrase_is_deterministic() {
        let a = derive_passphrase("key", "bucket/path", "salt");
        assert_eq!(a, derive_passphrase("key", "bucket/path", "salt"));
        assert_eq!(a.len(), 64);

        assert_ne!(a, derive_passphrase("key2", "bucket/path", "salt"));
        assert_ne!(a, derive_passphrase("key", "bucket/other", "salt"));
        assert_ne!(a, derive_passphrase("key", "bucket/path", "salt2"));
    }

    #[test]
    fn test_passphrase_matches_known_digest() {
        // sha256("a|b|c")
        assert_eq!(
            derive_passphrase("a", "b", "c"),
            "a52dd81bfd5e4e66d96b9f598382f6cbf8c5c3897654e6ae9055e03620fcf38e"
        );
    }

    #[test]
    fn test_site_url_precedence() {
        assert_eq!(site_url(Some("https://a.test/"), Some("b.test")), "https://a.test");
        assert_eq!(site_url(Some("  "), Some("https://b.test//")), "https://b.test");
        assert_eq!(site_url(None, None), "");
    }

    #[test]
    fn test_build_runtime_env() {
        let db = DbConnection {
            host: "db".to_string(),
            port: "3306".to_string(),
            database: "shop".to_string(),
            username: "app".to_string(),
            password: "pw".to_string(),
        };
        let ctx = EnvContext {
            salt: "salt",
            site_url: "https://shop.test",
            db: &db,
        };

        let env = build_runtime_env(&settings(), &ctx);
        assert_eq!(env.get("BACKUP_PATH"), Some("bucket/sub/dir"));
        assert_eq!(
            env.get("RESTIC_REPOSITORY"),
            Some("s3:https://s3.us-west-004.backblazeb2.com/bucket/sub/dir")
        );
        assert_eq!(
            env.get("RESTIC_PASSWORD"),
            Some(derive_passphrase("K004secret", "bucket/sub/dir", "salt").as_str())
        );
        assert_eq!(env.get("AWS_ACCESS_KEY_ID"), Some("0041abc"));
        assert_eq!(env.get("BACKUP_RETENTION_DAYS"), Some("30"));
        assert_eq!(env.get("BACKUP_FILE_COMPONENTS"), Some("config,uploads"));
        assert_eq!(env.get("RESTORE_TARGET_URL"), Some("https://shop.test"));
        assert_eq!(env.get("DB_NAME"), Some("shop"));
        assert_eq!(env.iter().next(), Some(("BACKUP_DRIVER", "native")));
        assert_eq!(env.iter().count(), 15);
    }

    #[test]
    fn test_debug_output_redacts_secrets() {
        let mut env = RuntimeEnv::default();
        env.set("AWS_SECRET_ACCESS_KEY", "topsecret");
        env.set("RESTIC_PASSWORD", "hunter2");
        env.set("BACKUP_PATH", "bucket");

        let rendered = format!("{:?}", env);
        assert!(!rendered.contains("topsecret"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("bucket"));
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut env = RuntimeEnv::default();
        env.set("A", "1");
        env.set("B", "2");
        env.set("A", "3");
        let pairs: Vec<_> = env.iter().collect();
        assert_eq!(pairs, vec![("A", "3"), ("B", "2")]);
    }
}
