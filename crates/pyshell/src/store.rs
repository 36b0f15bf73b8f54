//! Named instances on disk.
//!
//! Every instance lives in its own directory under the store root:
//!
//! ```text
//! <root>/<name>/env/    - isolated interpreter built by an EnvironmentBuilder
//! <root>/<name>/temp/   - scratch files for inline runs and requirement lists
//! <root>/<name>/.ready  - written once the build has fully succeeded
//! ```
//!
//! An instance directory without the ready marker is either still being built
//! or was left behind by an interrupted build; [`InstanceStore::create`]
//! rebuilds it.
//!
//! Names are case-insensitive (stored lowercase). The [`DEFAULT_INSTANCE`] is
//! never removed by [`InstanceStore::clear_all`] or [`InstanceStore::remove`].
//!
//! Running processes hold an [`InstanceLease`]; an instance with live leases
//! cannot be removed, and a lease taken with `discard` deletes the instance
//! once the last lease on it is dropped.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::DEFAULT_INSTANCE;
use crate::environment::{Environment, EnvironmentBuilder, Requirements};
use crate::error::{Result, ShellError};
use crate::scratch::{ScratchFile, clear_dir, unique_stamp};

const READY_MARKER: &str = ".ready";

/// A named environment plus its scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    name: String,
    dir: PathBuf,
    env: Environment,
    temp_dir: PathBuf,
}

impl Instance {
    fn at(root: &Path, name: String) -> Self {
        let dir = root.join(&name);
        Self {
            env: Environment::at(dir.join("env")),
            temp_dir: dir.join("temp"),
            dir,
            name,
        }
    }

    /// Normalised instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The instance's environment.
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// The environment's interpreter.
    pub fn interpreter(&self) -> &Path {
        self.env.interpreter()
    }

    /// Scratch directory for one-off files.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Whether the build finished, so the environment and its packages are usable.
    pub fn is_ready(&self) -> bool {
        self.dir.join(READY_MARKER).is_file()
    }

    /// Whether this is the reserved shared instance.
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_INSTANCE
    }
}

/// Validate an instance name and fold it to lowercase.
pub fn normalize_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    let invalid = || ShellError::InvalidInstanceName(name.to_string());

    if trimmed.is_empty() || trimmed.contains(['/', '\\', '\0']) {
        return Err(invalid());
    }
    let mut components = Path::new(trimmed).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(trimmed.to_lowercase()),
        _ => Err(invalid()),
    }
}

#[derive(Debug, Default)]
struct LeaseCount {
    holders: usize,
    discard: bool,
}

struct StoreInner {
    root: PathBuf,
    base_interpreter: PathBuf,
    builder: Arc<dyn EnvironmentBuilder>,
    creation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    leases: Mutex<HashMap<String, LeaseCount>>,
}

/// Creates, finds and deletes instances under a root directory.
///
/// Cloning shares the same store.
#[derive(Clone)]
pub struct InstanceStore {
    inner: Arc<StoreInner>,
}

impl fmt::Debug for InstanceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceStore")
            .field("root", &self.inner.root)
            .field("base_interpreter", &self.inner.base_interpreter)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InstanceStore {
    /// Create a store rooted at `root` that builds environments from `base_interpreter`.
    pub fn new(
        root: impl Into<PathBuf>,
        base_interpreter: impl Into<PathBuf>,
        builder: Arc<dyn EnvironmentBuilder>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                root: root.into(),
                base_interpreter: base_interpreter.into(),
                builder,
                creation_locks: Mutex::new(HashMap::new()),
                leases: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Directory containing the instances.
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Interpreter environments are built from.
    pub fn base_interpreter(&self) -> &Path {
        &self.inner.base_interpreter
    }

    fn locate(&self, name: String) -> Instance {
        Instance::at(&self.inner.root, name)
    }

    fn creation_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = lock(&self.inner.creation_locks);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    fn prune_creation_lock(&self, name: &str) {
        let mut locks = lock(&self.inner.creation_locks);
        if locks.get(name).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(name);
        }
    }

    /// Whether an instance directory exists for `name`.
    pub fn exists(&self, name: &str) -> bool {
        normalize_name(name)
            .map(|name| self.locate(name).dir.is_dir())
            .unwrap_or(false)
    }

    /// Create an instance, or return it unchanged if it is already built.
    ///
    /// Without a name a unique one is generated. Concurrent calls for the same
    /// name are serialised, so only one of them builds. If the build fails the
    /// partially created directory is removed. A directory left without a
    /// ready marker is deleted and built again.
    pub async fn create(
        &self,
        name: Option<&str>,
        requirements: &Requirements,
    ) -> Result<Instance> {
        let name = match name {
            Some(name) => normalize_name(name)?,
            None => format!("instance-{}", unique_stamp()),
        };
        let creation = self.creation_lock(&name);
        let _guard = creation.lock().await;

        let instance = self.locate(name);
        if instance.is_ready() {
            tracing::debug!("Instance [{}] already exists", instance.name);
            return Ok(instance);
        }
        if instance.dir.is_dir() {
            tracing::warn!("Instance [{}] was never completed, rebuilding", instance.name);
            tokio::fs::remove_dir_all(&instance.dir).await?;
        }

        tracing::info!("Creating instance [{}]", instance.name);
        tokio::fs::create_dir_all(&instance.temp_dir).await?;
        let built = match self
            .inner
            .builder
            .build(
                &self.inner.base_interpreter,
                instance.env.root(),
                &instance.temp_dir,
                requirements,
            )
            .await
        {
            Ok(_) => tokio::fs::write(instance.dir.join(READY_MARKER), b"")
                .await
                .map_err(ShellError::from),
            Err(e) => Err(e),
        };

        match built {
            Ok(()) => {
                tracing::info!("Instance [{}] created", instance.name);
                Ok(instance)
            }
            Err(e) => {
                tracing::warn!("Building instance [{}] failed: {}", instance.name, e);
                if let Err(cleanup) = tokio::fs::remove_dir_all(&instance.dir).await {
                    tracing::warn!(
                        "Failed to remove partial instance {}: {}",
                        instance.dir.display(),
                        cleanup
                    );
                }
                Err(e)
            }
        }
    }

    /// Return the instance, creating it without extra requirements if absent.
    pub async fn get_or_create(&self, name: &str) -> Result<Instance> {
        self.create(Some(name), &Requirements::None).await
    }

    /// Return an existing instance.
    pub fn get(&self, name: &str) -> Result<Instance> {
        let instance = self.locate(normalize_name(name)?);
        if instance.dir.is_dir() {
            Ok(instance)
        } else {
            Err(ShellError::InstanceNotFound(instance.name))
        }
    }

    /// Names of all instances, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.inner.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete the instance's scratch files.
    ///
    /// Files still owned by an in-flight run or install are kept.
    pub fn clear(&self, name: &str) -> Result<()> {
        let instance = self.get(name)?;
        let kept = clear_dir(&instance.temp_dir)?;
        tracing::debug!(
            "Cleared scratch files of [{}], kept {} in use",
            instance.name,
            kept
        );
        Ok(())
    }

    /// Remove every instance except the default one.
    ///
    /// Instances that are in use or being built are skipped. Returns the
    /// names that were removed.
    pub fn clear_all(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        let leases = lock(&self.inner.leases);
        for name in self.list()? {
            if name.eq_ignore_ascii_case(DEFAULT_INSTANCE) {
                continue;
            }
            if leases.get(&name).is_some_and(|l| l.holders > 0) {
                tracing::info!("Skipping instance [{}]: in use", name);
                continue;
            }
            let creation = self.creation_lock(&name);
            let Ok(_guard) = creation.try_lock() else {
                tracing::info!("Skipping instance [{}]: being created", name);
                continue;
            };
            std::fs::remove_dir_all(self.inner.root.join(&name))?;
            tracing::info!("Removed instance [{}]", name);
            removed.push(name);
        }
        drop(leases);
        for name in &removed {
            self.prune_creation_lock(name);
        }
        Ok(removed)
    }

    /// Delete an instance's whole directory tree.
    pub fn remove(&self, name: &str) -> Result<()> {
        let name = normalize_name(name)?;
        if name == DEFAULT_INSTANCE {
            return Err(ShellError::ReservedInstance(name));
        }

        let leases = lock(&self.inner.leases);
        if leases.get(&name).is_some_and(|l| l.holders > 0) {
            return Err(ShellError::InstanceInUse(name));
        }
        let creation = self.creation_lock(&name);
        let Ok(guard) = creation.try_lock() else {
            return Err(ShellError::InstanceInUse(name));
        };

        let instance = self.locate(name);
        if !instance.dir.is_dir() {
            return Err(ShellError::InstanceNotFound(instance.name));
        }
        std::fs::remove_dir_all(&instance.dir)?;
        tracing::info!("Removed instance [{}]", instance.name);

        drop(guard);
        drop(creation);
        drop(leases);
        self.prune_creation_lock(&instance.name);
        Ok(())
    }

    /// Install requirement specifiers into an instance.
    pub async fn install_requirements(
        &self,
        instance: &Instance,
        requirements: &[String],
    ) -> Result<()> {
        if requirements.iter().all(|r| r.trim().is_empty()) {
            return Ok(());
        }
        let file = ScratchFile::create(&instance.temp_dir, "txt", &requirements.join("\n"))?;
        self.inner.builder.install(&instance.env, file.path()).await
    }

    /// Install a requirements file into an instance.
    pub async fn install_requirements_file(&self, instance: &Instance, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Err(ShellError::FileNotFound(path.to_path_buf()));
        }
        self.inner.builder.install(&instance.env, path).await
    }

    /// Get or create an instance and mark it as in use.
    ///
    /// With `discard`, the instance is deleted once the last lease on it is
    /// dropped (the default instance is never deleted).
    pub async fn checkout(&self, name: Option<&str>, discard: bool) -> Result<InstanceLease> {
        loop {
            let instance = self.create(name, &Requirements::None).await?;
            let mut leases = lock(&self.inner.leases);
            // A concurrent removal may have won between creation and here
            if !instance.is_ready() {
                tracing::debug!("Instance [{}] vanished before checkout, retrying", instance.name);
                continue;
            }
            let count = leases.entry(instance.name.clone()).or_default();
            count.holders += 1;
            count.discard |= discard;
            return Ok(InstanceLease {
                store: self.clone(),
                instance,
            });
        }
    }

    /// Number of live leases on `name`.
    pub fn lease_count(&self, name: &str) -> usize {
        let Ok(name) = normalize_name(name) else {
            return 0;
        };
        lock(&self.inner.leases)
            .get(&name)
            .map(|l| l.holders)
            .unwrap_or(0)
    }

    fn release(&self, instance: &Instance) {
        let mut leases = lock(&self.inner.leases);
        let Some(count) = leases.get_mut(&instance.name) else {
            tracing::warn!("Released instance [{}] without a lease", instance.name);
            return;
        };
        count.holders = count.holders.saturating_sub(1);
        if count.holders > 0 {
            return;
        }
        let discard = count.discard;
        leases.remove(&instance.name);

        if discard && !instance.is_default() {
            match std::fs::remove_dir_all(&instance.dir) {
                Ok(()) => tracing::info!("Discarded instance [{}]", instance.name),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    "Failed to discard instance {}: {}",
                    instance.dir.display(),
                    e
                ),
            }
            drop(leases);
            self.prune_creation_lock(&instance.name);
        }
    }
}

/// Marks an instance as used by a run; released on drop.
pub struct InstanceLease {
    store: InstanceStore,
    instance: Instance,
}

impl fmt::Debug for InstanceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceLease")
            .field("instance", &self.instance.name)
            .finish_non_exhaustive()
    }
}

impl InstanceLease {
    /// The leased instance.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.store.release(&self.instance);
    }
}

#[cfg(test)]
#[cfg(unix)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tests::FakeBuilder;

    fn store(root: &Path) -> (InstanceStore, Arc<FakeBuilder>) {
        let builder = Arc::new(FakeBuilder::default());
        let store = InstanceStore::new(root.join("instances"), "/bin/sh", builder.clone());
        (store, builder)
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Default").unwrap(), "default");
        assert_eq!(normalize_name("  data-job ").unwrap(), "data-job");
        for bad in ["", "   ", ".", "..", "a/b", "a\\b", "/abs"] {
            assert!(
                matches!(normalize_name(bad), Err(ShellError::InvalidInstanceName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_create_then_get_returns_same_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (store, builder) = store(dir.path());

        let created = store.create(Some("Alpha"), &Requirements::None).await.unwrap();
        let fetched = store.get("alpha").unwrap();

        assert_eq!(created, fetched);
        assert_eq!(created.name(), "alpha");
        assert_eq!(created.dir(), dir.path().join("instances/alpha"));
        assert_eq!(created.temp_dir(), dir.path().join("instances/alpha/temp"));
        assert_eq!(created.environment().root(), dir.path().join("instances/alpha/env"));
        assert!(created.temp_dir().is_dir());
        assert!(created.environment().is_ready());
        assert_eq!(builder.builds(), 1);
    }

    #[tokio::test]
    async fn test_create_existing_does_not_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let (store, builder) = store(dir.path());

        store.create(Some("beta"), &Requirements::None).await.unwrap();
        let again = store
            .create(Some("BETA"), &Requirements::List(vec!["numpy".to_string()]))
            .await
            .unwrap();

        assert_eq!(again.name(), "beta");
        assert_eq!(builder.builds(), 1);
    }

    #[tokio::test]
    async fn test_create_passes_requirements_to_builder() {
        let dir = tempfile::tempdir().unwrap();
        let (store, builder) = store(dir.path());
        let requirements = Requirements::List(vec!["requests==2.31".to_string()]);

        let instance = store.create(Some("gamma"), &requirements).await.unwrap();

        assert_eq!(builder.last_requirements(), Some(requirements));
        assert_eq!(builder.last_scratch_dir().as_deref(), Some(instance.temp_dir()));
    }

    #[tokio::test]
    async fn test_instance_not_ready_until_build_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(FakeBuilder::slow(std::time::Duration::from_millis(300)));
        let store = InstanceStore::new(dir.path().join("instances"), "/bin/sh", builder);
        let building = {
            let store = store.clone();
            tokio::spawn(async move { store.get_or_create("slow").await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let pending = store.locate("slow".to_string());
        assert!(pending.environment().is_ready(), "interpreter exists mid-build");
        assert!(!pending.is_ready());

        let instance = building.await.unwrap().unwrap();
        assert!(instance.is_ready());
    }

    #[tokio::test]
    async fn test_unfinished_instance_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let (store, builder) = store(dir.path());
        // Left behind by a build that never completed
        let stale = dir.path().join("instances/stale");
        std::fs::create_dir_all(stale.join("env")).unwrap();
        std::fs::write(stale.join("leftover"), "x").unwrap();

        let instance = store.get_or_create("stale").await.unwrap();

        assert_eq!(builder.builds(), 1);
        assert!(instance.is_ready());
        assert!(instance.environment().is_ready());
        assert!(!stale.join("leftover").exists());
    }

    #[tokio::test]
    async fn test_anonymous_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        let a = store.create(None, &Requirements::None).await.unwrap();
        let b = store.create(None, &Requirements::None).await.unwrap();

        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("instance-"));
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_create_builds_once() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(FakeBuilder::slow(std::time::Duration::from_millis(50)));
        let store = InstanceStore::new(dir.path().join("instances"), "/bin/sh", builder.clone());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_or_create("shared").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(builder.builds(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let builder = Arc::new(FakeBuilder::failing());
        let store = InstanceStore::new(dir.path().join("instances"), "/bin/sh", builder);

        let err = store.get_or_create("broken").await.unwrap_err();

        assert!(matches!(err, ShellError::EnvironmentCreationFailed { .. }));
        assert!(!store.exists("broken"));
        assert!(matches!(store.get("broken"), Err(ShellError::InstanceNotFound(_))));
    }

    #[tokio::test]
    async fn test_get_is_strict() {
        let dir = tempfile::tempdir().unwrap();
        let (store, builder) = store(dir.path());

        assert!(matches!(
            store.get("missing"),
            Err(ShellError::InstanceNotFound(n)) if n == "missing"
        ));
        assert_eq!(builder.builds(), 0);

        // get_or_create heals the miss
        store.get_or_create("missing").await.unwrap();
        assert!(store.get("missing").is_ok());
    }

    #[tokio::test]
    async fn test_clear_only_touches_scratch() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let instance = store.get_or_create("scratchy").await.unwrap();
        std::fs::write(instance.temp_dir().join("a.py"), "x").unwrap();
        std::fs::create_dir(instance.temp_dir().join("nested")).unwrap();
        std::fs::write(instance.temp_dir().join("nested/b.py"), "y").unwrap();

        store.clear("scratchy").unwrap();

        assert_eq!(std::fs::read_dir(instance.temp_dir()).unwrap().count(), 0);
        assert!(instance.environment().is_ready());
    }

    #[tokio::test]
    async fn test_clear_keeps_scratch_files_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let instance = store.get_or_create("busy").await.unwrap();
        let pending = ScratchFile::create(instance.temp_dir(), "py", "echo hi\n").unwrap();
        std::fs::write(instance.temp_dir().join("old.py"), "x").unwrap();

        store.clear("busy").unwrap();

        assert!(pending.path().exists());
        assert!(!instance.temp_dir().join("old.py").exists());
        drop(pending);
        assert_eq!(std::fs::read_dir(instance.temp_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_clear_all_keeps_default() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        for name in ["default", "one", "two"] {
            store.get_or_create(name).await.unwrap();
        }

        let mut removed = store.clear_all().unwrap();
        removed.sort();

        assert_eq!(removed, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(store.list().unwrap(), vec!["default".to_string()]);

        // Clearing again with only the default left is a no-op
        assert!(store.clear_all().unwrap().is_empty());
        assert!(store.exists("DEFAULT"));
    }

    #[tokio::test]
    async fn test_clear_all_skips_leased_instances() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        let lease = store.checkout(Some("busy"), false).await.unwrap();
        store.get_or_create("idle").await.unwrap();

        assert_eq!(store.clear_all().unwrap(), vec!["idle".to_string()]);
        assert!(store.exists("busy"));

        drop(lease);
        assert_eq!(store.clear_all().unwrap(), vec!["busy".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_missing_leaves_tree_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        store.get_or_create("keep").await.unwrap();
        let before = store.list().unwrap();

        let err = store.remove("nonexistent").unwrap_err();

        assert!(matches!(err, ShellError::InstanceNotFound(n) if n == "nonexistent"));
        assert_eq!(store.list().unwrap(), before);
    }

    #[tokio::test]
    async fn test_remove_rules() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        store.get_or_create("default").await.unwrap();
        let lease = store.checkout(Some("worker"), false).await.unwrap();

        assert!(matches!(store.remove("Default"), Err(ShellError::ReservedInstance(_))));
        assert!(matches!(store.remove("worker"), Err(ShellError::InstanceInUse(_))));

        drop(lease);
        store.remove("worker").unwrap();
        assert!(!store.exists("worker"));
    }

    #[tokio::test]
    async fn test_discarding_lease_deletes_after_last_holder() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        let first = store.checkout(Some("temp-job"), true).await.unwrap();
        let second = store.checkout(Some("temp-job"), false).await.unwrap();
        assert_eq!(store.lease_count("temp-job"), 2);

        drop(first);
        assert!(store.exists("temp-job"), "still leased by the second run");

        drop(second);
        assert!(!store.exists("temp-job"));
        assert_eq!(store.lease_count("temp-job"), 0);
    }

    #[tokio::test]
    async fn test_discarding_lease_never_deletes_default() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());

        let lease = store.checkout(Some("default"), true).await.unwrap();
        drop(lease);

        assert!(store.exists("default"));
    }

    #[tokio::test]
    async fn test_checkout_after_discard_rebuilds() {
        let dir = tempfile::tempdir().unwrap();
        let (store, builder) = store(dir.path());

        drop(store.checkout(Some("again"), true).await.unwrap());
        let lease = store.checkout(Some("again"), true).await.unwrap();

        assert!(lease.instance().environment().is_ready());
        assert_eq!(builder.builds(), 2);
    }

    #[tokio::test]
    async fn test_install_requirements_writes_and_removes_list() {
        let dir = tempfile::tempdir().unwrap();
        let (store, builder) = store(dir.path());
        let instance = store.get_or_create("deps").await.unwrap();

        store
            .install_requirements(&instance, &["numpy".to_string(), "pandas".to_string()])
            .await
            .unwrap();

        assert_eq!(builder.installed(), vec!["numpy\npandas".to_string()]);
        assert_eq!(std::fs::read_dir(instance.temp_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_install_requirements_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let (store, builder) = store(dir.path());
        let instance = store.get_or_create("deps").await.unwrap();

        let err = store
            .install_requirements_file(&instance, &dir.path().join("nope.txt"))
            .await
            .unwrap_err();

        assert!(matches!(err, ShellError::FileNotFound(_)));
        assert!(builder.installed().is_empty());
    }

    #[test]
    fn test_list_without_root() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store(dir.path());
        assert!(store.list().unwrap().is_empty());
    }
}
