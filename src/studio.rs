use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::{Engine, PolicyConfig};
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::sweeper;

/// Manages per-studio engines. Each studio gets its own Engine + WAL + sweeper.
/// Studio = the key the embedding service routes booking traffic by.
pub struct StudioManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl StudioManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create an engine for the given studio.
    pub fn get_or_create(&self, studio: &str) -> std::io::Result<Arc<Engine>> {
        self.get_or_create_with_policy(studio, PolicyConfig::default())
    }

    /// Like [`Self::get_or_create`], but a newly created engine uses the
    /// given policy. The policy argument is ignored when the studio's
    /// engine already exists.
    pub fn get_or_create_with_policy(
        &self,
        studio: &str,
        policy: PolicyConfig,
    ) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(studio) {
            return Ok(engine.value().clone());
        }
        if studio.len() > MAX_STUDIO_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "studio name too long",
            ));
        }
        if self.engines.len() >= MAX_STUDIOS {
            return Err(std::io::Error::other("too many studios"));
        }

        // Sanitize studio name to prevent path traversal
        let safe_name: String = studio
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty studio name",
            ));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::with_policy(wal_path, notify, policy)?);

        // Spawn sweeper + compactor for this studio
        let sweeper_engine = engine.clone();
        tokio::spawn(async move {
            sweeper::run_sweeper(sweeper_engine).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            sweeper::run_compactor(compactor_engine, threshold).await;
        });

        self.engines.insert(studio.to_string(), engine.clone());
        metrics::gauge!(crate::observability::STUDIOS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::now_ms;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn scratch(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rollcall_studio_{label}_{}", Ulid::new()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn registry_caches_one_engine_per_name() {
        let dir = scratch("registry");
        let sm = StudioManager::new(dir.clone(), 1000);

        // Nothing on disk until a studio asks for its engine
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let first = sm.get_or_create("flow_yoga").unwrap();
        assert!(dir.join("flow_yoga.wal").exists());

        let second = sm.get_or_create("flow_yoga").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn studios_do_not_share_state() {
        let dir = scratch("isolation");
        let sm = StudioManager::new(dir, 1000);

        let uptown = sm.get_or_create("uptown").unwrap();
        let downtown = sm.get_or_create("downtown").unwrap();

        // One class id registered on both sides, booked only downtown
        let class_id = Ulid::new();
        let start_at = now_ms() + 3_600_000;
        uptown.register_class(class_id, start_at, 1).await.unwrap();
        downtown.register_class(class_id, start_at, 1).await.unwrap();

        let receipt = downtown
            .create_booking(class_id, Ulid::new(), PaymentMethod::Cash)
            .await
            .unwrap();
        downtown.confirm_payment(receipt.booking_id).await.unwrap();

        assert_eq!(downtown.get_capacity(class_id).await.unwrap().confirmed, 1);
        assert_eq!(uptown.get_capacity(class_id).await.unwrap().confirmed, 0);
        assert!(uptown.bookings_for_class(class_id).await.is_empty());
    }

    #[tokio::test]
    async fn policy_is_pinned_at_creation() {
        let dir = scratch("policy");
        let sm = StudioManager::new(dir, 1000);

        let policy = PolicyConfig {
            cancellation_window_ms: 60_000,
            pending_payment_ttl_ms: 1_000,
        };
        let eng = sm.get_or_create_with_policy("strict", policy).unwrap();
        assert_eq!(eng.policy.cancellation_window_ms, 60_000);
        assert_eq!(eng.policy.pending_payment_ttl_ms, 1_000);

        // A later caller cannot re-policy an existing studio
        let again = sm
            .get_or_create_with_policy("strict", PolicyConfig::default())
            .unwrap();
        assert_eq!(again.policy.cancellation_window_ms, 60_000);
    }

    #[tokio::test]
    async fn hostile_names_stay_inside_the_data_dir() {
        let dir = scratch("names");
        let sm = StudioManager::new(dir.clone(), 1000);

        sm.get_or_create("../evil").unwrap();
        let files: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec!["evil.wal"]);

        // Nothing survives sanitization
        let err = sm.get_or_create("../..").err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn name_length_is_bounded() {
        let dir = scratch("name_len");
        let sm = StudioManager::new(dir, 1000);

        let over = "x".repeat(MAX_STUDIO_NAME_LEN + 1);
        let err = sm.get_or_create(&over).err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

        // At the limit our check passes; "{name}.wal" can still trip the
        // OS filename cap, which reports as something other than
        // InvalidInput.
        let at_limit = "x".repeat(MAX_STUDIO_NAME_LEN);
        if let Err(e) = sm.get_or_create(&at_limit) {
            assert_ne!(e.kind(), std::io::ErrorKind::InvalidInput);
        }
    }

    #[tokio::test]
    async fn studio_count_is_capped() {
        let dir = scratch("cap");
        let sm = StudioManager::new(dir, 1000);

        for i in 0..MAX_STUDIOS {
            sm.get_or_create(&format!("s{i}")).unwrap();
        }
        let err = sm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many studios"));
    }
}
