//! Per-user state store shared by the multi-tenant sub-services.
//!
//! Each sub-service keeps one JSON file per user under its own directory
//! (`qqpd_users/`, `weibo_users/`), with an in-memory map as the authority
//! during a run. Every mutation is a full-file replacement written to a
//! temp file and renamed into place. A daily sweeper expires users idle for
//! 90 days and deletes expired users untouched for another 30.
//!
//! Cookies are the only secret in these records; when an encryption key is
//! configured the store wraps the cookie field in AES-256-GCM before it
//! touches disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Idle time after which a user is marked expired.
const INACTIVE_AFTER: chrono::Duration = chrono::Duration::days(90);
/// Time an expired user may linger before the file is deleted.
const DELETE_EXPIRED_AFTER: chrono::Duration = chrono::Duration::days(30);
/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Marker prefix for encrypted cookie values on disk.
const ENC_PREFIX: &str = "gcm:";

/// Lifecycle state of a sub-service user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Pending,
    Active,
    Expired,
}

/// What the store needs to know about a user record.
pub trait UserRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// 64-hex identity; the on-disk filename and URL path segment.
    fn hash(&self) -> &str;
    fn status(&self) -> UserStatus;
    fn set_status(&mut self, status: UserStatus);
    fn last_access_at(&self) -> DateTime<Utc>;
    /// The upstream session cookie; wiped on expiry, wrapped on disk.
    fn cookie_mut(&mut self) -> &mut String;
}

/// AES-256-GCM wrapping for stored cookies.
pub struct CookieCipher {
    cipher: Aes256Gcm,
}

impl CookieCipher {
    /// Key material is truncated/padded to exactly 32 bytes the way the
    /// service has always done it; `None` for an empty key.
    pub fn from_key(key: &str) -> Option<Self> {
        if key.is_empty() {
            return None;
        }
        let mut material = [0u8; 32];
        let bytes = key.as_bytes();
        for (slot, byte) in material.iter_mut().zip(bytes.iter()) {
            *slot = *byte;
        }
        Some(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&material)),
        })
    }

    fn encrypt(&self, plaintext: &str) -> Option<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self.cipher.encrypt(&nonce, plaintext.as_bytes()).ok()?;
        let mut wrapped = nonce.to_vec();
        wrapped.extend_from_slice(&ciphertext);
        Some(format!("{ENC_PREFIX}{}", BASE64.encode(wrapped)))
    }

    fn decrypt(&self, wrapped: &str) -> Option<String> {
        let encoded = wrapped.strip_prefix(ENC_PREFIX)?;
        let raw = BASE64.decode(encoded).ok()?;
        if raw.len() < 12 {
            return None;
        }
        let (nonce, ciphertext) = raw.split_at(12);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()?;
        String::from_utf8(plaintext).ok()
    }
}

/// DashMap-backed user store with atomic JSON persistence.
pub struct UserStore<T: UserRecord> {
    label: &'static str,
    dir: PathBuf,
    users: DashMap<String, T>,
    cipher: Option<CookieCipher>,
}

impl<T: UserRecord> UserStore<T> {
    /// Creates the directory if needed and loads every user file into
    /// memory. Unreadable files are skipped with a warning.
    pub fn open(
        label: &'static str,
        dir: impl Into<PathBuf>,
        cipher: Option<CookieCipher>,
    ) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let store = Self {
            label,
            dir,
            users: DashMap::new(),
            cipher,
        };

        let mut loaded = 0usize;
        for entry in std::fs::read_dir(&store.dir)? {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match store.load_file(&path) {
                Some(user) => {
                    store.users.insert(user.hash().to_string(), user);
                    loaded += 1;
                }
                None => warn!(service = label, path = %path.display(), "skipping unreadable user file"),
            }
        }
        info!(service = label, users = loaded, "user store loaded");

        Ok(store)
    }

    fn load_file(&self, path: &Path) -> Option<T> {
        let data = std::fs::read(path).ok()?;
        let mut user: T = serde_json::from_slice(&data).ok()?;
        if let Some(cipher) = &self.cipher {
            let cookie = user.cookie_mut();
            if cookie.starts_with(ENC_PREFIX) {
                match cipher.decrypt(cookie) {
                    Some(plain) => *cookie = plain,
                    None => {
                        warn!(service = self.label, path = %path.display(), "cookie unwrap failed, clearing");
                        cookie.clear();
                    }
                }
            }
        }
        Some(user)
    }

    pub fn get(&self, hash: &str) -> Option<T> {
        self.users.get(hash).map(|user| user.clone())
    }

    /// Updates memory and persists the full record atomically.
    pub fn save(&self, user: &T) -> std::io::Result<()> {
        self.users.insert(user.hash().to_string(), user.clone());
        self.persist(user)
    }

    fn persist(&self, user: &T) -> std::io::Result<()> {
        let mut on_disk = user.clone();
        if let Some(cipher) = &self.cipher {
            let cookie = on_disk.cookie_mut();
            if !cookie.is_empty() {
                if let Some(wrapped) = cipher.encrypt(cookie) {
                    *cookie = wrapped;
                }
            }
        }

        let path = self.dir.join(format!("{}.json", user.hash()));
        let tmp = self.dir.join(format!("{}.json.tmp", user.hash()));
        let data = serde_json::to_vec_pretty(&on_disk)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)
    }

    /// Removes the user from memory and disk.
    pub fn delete(&self, hash: &str) -> std::io::Result<()> {
        self.users.remove(hash);
        let path = self.dir.join(format!("{hash}.json"));
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Snapshot of every user as of iteration start.
    pub fn all(&self) -> Vec<T> {
        self.users.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// One sweep pass: `(marked_expired, deleted)`.
    pub fn sweep(&self, now: DateTime<Utc>) -> (usize, usize) {
        let mut marked = 0usize;
        let mut deleted = 0usize;

        for mut user in self.all() {
            if user.status() == UserStatus::Expired {
                if user.last_access_at() + DELETE_EXPIRED_AFTER < now
                    && self.delete(&user.hash().to_string()).is_ok()
                {
                    deleted += 1;
                }
            } else if user.last_access_at() + INACTIVE_AFTER < now {
                user.set_status(UserStatus::Expired);
                user.cookie_mut().clear();
                if self.save(&user).is_ok() {
                    marked += 1;
                }
            }
        }

        (marked, deleted)
    }

    /// Daily sweeper task.
    pub fn spawn_sweeper(store: &Arc<Self>) {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (marked, deleted) = store.sweep(Utc::now());
                if marked > 0 || deleted > 0 {
                    info!(
                        service = store.label,
                        marked, deleted, "user sweep finished"
                    );
                }
            }
        });
    }
}

/// Derives the public per-user identity: `sha256(principal ∥ salt)` as hex.
pub fn principal_hash(principal: &str, salt: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(format!("{principal}{salt}").as_bytes());
    hex::encode(digest)
}

/// True for a 64-char hex string (a pre-hashed identity in a URL).
pub fn is_identity_hash(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestUser {
        hash: String,
        cookie: String,
        status: UserStatus,
        last_access_at: DateTime<Utc>,
    }

    impl UserRecord for TestUser {
        fn hash(&self) -> &str {
            &self.hash
        }
        fn status(&self) -> UserStatus {
            self.status
        }
        fn set_status(&mut self, status: UserStatus) {
            self.status = status;
        }
        fn last_access_at(&self) -> DateTime<Utc> {
            self.last_access_at
        }
        fn cookie_mut(&mut self) -> &mut String {
            &mut self.cookie
        }
    }

    fn user(hash: &str, cookie: &str, days_ago: i64) -> TestUser {
        TestUser {
            hash: hash.to_string(),
            cookie: cookie.to_string(),
            status: UserStatus::Active,
            last_access_at: Utc::now() - chrono::Duration::days(days_ago),
        }
    }

    #[test]
    fn hash_is_stable_and_salted() {
        let a = principal_hash("10001", "salt-a");
        let b = principal_hash("10001", "salt-a");
        let c = principal_hash("10001", "salt-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(is_identity_hash(&a));
        assert!(!is_identity_hash("10001"));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store: UserStore<TestUser> = UserStore::open("test", dir.path(), None).unwrap();
        let original = user("a".repeat(64).as_str(), "SUB=xyz", 0);
        store.save(&original).unwrap();

        // A second store over the same directory sees the same record.
        let reopened: UserStore<TestUser> = UserStore::open("test", dir.path(), None).unwrap();
        let loaded = reopened.get(original.hash()).unwrap();
        assert_eq!(loaded.cookie, "SUB=xyz");
    }

    #[test]
    fn cookie_is_wrapped_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = CookieCipher::from_key("super-secret-key").unwrap();
        let store: UserStore<TestUser> =
            UserStore::open("test", dir.path(), Some(cipher)).unwrap();
        let original = user("b".repeat(64).as_str(), "SUB=secret-cookie", 0);
        store.save(&original).unwrap();

        let raw = std::fs::read_to_string(
            dir.path().join(format!("{}.json", original.hash())),
        )
        .unwrap();
        assert!(!raw.contains("secret-cookie"));
        assert!(raw.contains(ENC_PREFIX));

        let reopened: UserStore<TestUser> = UserStore::open(
            "test",
            dir.path(),
            Some(CookieCipher::from_key("super-secret-key").unwrap()),
        )
        .unwrap();
        assert_eq!(reopened.get(original.hash()).unwrap().cookie, "SUB=secret-cookie");
    }

    #[test]
    fn sweep_marks_then_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store: UserStore<TestUser> = UserStore::open("test", dir.path(), None).unwrap();

        store.save(&user(&"c".repeat(64), "k", 120)).unwrap();
        let (marked, deleted) = store.sweep(Utc::now());
        assert_eq!((marked, deleted), (1, 0));
        let marked_user = store.get(&"c".repeat(64)).unwrap();
        assert_eq!(marked_user.status, UserStatus::Expired);
        assert!(marked_user.cookie.is_empty());

        // Already expired and idle past the deletion horizon.
        let mut stale = user(&"d".repeat(64), "", 40);
        stale.status = UserStatus::Expired;
        store.save(&stale).unwrap();
        let (_, deleted) = store.sweep(Utc::now());
        assert_eq!(deleted, 1);
        assert!(store.get(&"d".repeat(64)).is_none());
    }
}
