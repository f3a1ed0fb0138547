//! Loading a checker from module and dataset locations.

use crate::checker::PermissionChecker;
use crate::source::{Location, SourceFetcher};
use permbridge_core::{BindingStage, BridgeConfig, BridgeError, BridgeResult};
use permbridge_wasm::{GuestInstance, Lifecycle, LifecycleState, WasmCompiler};
use std::sync::Arc;

/// Builds checkers with a fixed configuration
pub struct Loader {
    config: BridgeConfig,
    fetcher: SourceFetcher,
}

impl Loader {
    /// Create a loader
    ///
    /// # Errors
    ///
    /// Returns a binding failure if the HTTP client cannot be built
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        let fetcher = SourceFetcher::new(config.fetch_timeout())?;
        Ok(Self { config, fetcher })
    }

    /// Get the configuration
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Fetch both sources, then compile and instantiate the module
    ///
    /// The module and dataset are fetched concurrently. Nothing is
    /// instantiated unless both arrive.
    ///
    /// # Errors
    ///
    /// Returns a binding failure naming the stage that failed
    pub async fn load(&self, module: &str, dataset: &str) -> BridgeResult<PermissionChecker> {
        let module_location = parse(module, BindingStage::FetchModule)?;
        let dataset_location = parse(dataset, BindingStage::FetchDataset)?;

        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(LifecycleState::Loading)?;
        tracing::info!(module = %module_location, dataset = %dataset_location, "loading checker");

        let (bytes, dataset) = tokio::try_join!(
            self.fetcher.fetch_module(&module_location),
            self.fetcher.fetch_dataset(&dataset_location),
        )?;

        let compiler = WasmCompiler::new(self.config.clone())?;
        let compiled = compiler.compile(&bytes)?;
        let instance = GuestInstance::instantiate(&compiler, &compiled, Arc::new(dataset), lifecycle)?;

        Ok(PermissionChecker::new(instance))
    }
}

/// Load a checker with the default configuration
///
/// # Errors
///
/// Returns a binding failure naming the stage that failed
pub async fn load_checker(module: &str, dataset: &str) -> BridgeResult<PermissionChecker> {
    Loader::new(BridgeConfig::default())?
        .load(module, dataset)
        .await
}

fn parse(location: &str, stage: BindingStage) -> BridgeResult<Location> {
    location
        .parse()
        .map_err(|e| BridgeError::binding(stage, format!("'{location}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use permbridge_core::KeyFraming;
    use permbridge_wasm::testing::GuestBuilder;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_sources(dir: &Path, builder: &GuestBuilder, dataset: &str) -> (String, String) {
        let module = dir.join("module.wasm");
        let db = dir.join("db.json");
        std::fs::write(&module, builder.build()).unwrap();
        std::fs::write(&db, dataset).unwrap();
        (
            module.to_string_lossy().into_owned(),
            db.to_string_lossy().into_owned(),
        )
    }

    #[tokio::test]
    async fn test_load_checker_end_to_end() {
        let dir = TempDir::new().unwrap();
        let (module, db) = write_sources(dir.path(), &GuestBuilder::new(), r#"{"perm:1:2:edit": true}"#);

        let checker = load_checker(&module, &db).await.unwrap();
        assert_eq!(checker.state().unwrap(), LifecycleState::Ready);
        assert_eq!(checker.describe(1, 2, "edit").as_deref(), Some("user 1 has edit"));
        assert_eq!(
            checker.describe(1, 2, "delete").as_deref(),
            Some("user 1 has not delete")
        );
    }

    #[tokio::test]
    async fn test_load_with_file_scheme() {
        let dir = TempDir::new().unwrap();
        let (module, db) = write_sources(dir.path(), &GuestBuilder::new(), r#"{"perm:3:4:view": true}"#);

        let checker = load_checker(&format!("file://{module}"), &format!("file://{db}"))
            .await
            .unwrap();
        assert!(checker.check(3, 4, "view").unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_load_with_length_prefixed_keys() {
        let dir = TempDir::new().unwrap();
        let builder = GuestBuilder::new().key_framing(KeyFraming::LengthPrefixed).sized_free();
        let (module, db) = write_sources(dir.path(), &builder, r#"{"perm:1:2:edit": true}"#);

        let config = BridgeConfig::default().with_key_framing(KeyFraming::LengthPrefixed);
        let checker = Loader::new(config).unwrap().load(&module, &db).await.unwrap();
        assert!(checker.check(1, 2, "edit").unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_missing_module() {
        let dir = TempDir::new().unwrap();
        let (_, db) = write_sources(dir.path(), &GuestBuilder::new(), "{}");
        let missing = dir.path().join("absent.wasm");

        let err = load_checker(&missing.to_string_lossy(), &db).await.err().unwrap();
        assert!(matches!(
            err,
            BridgeError::BindingFailure { stage: BindingStage::FetchModule, .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_dataset() {
        let dir = TempDir::new().unwrap();
        let (module, db) = write_sources(dir.path(), &GuestBuilder::new(), "not json");

        let err = load_checker(&module, &db).await.err().unwrap();
        assert!(matches!(
            err,
            BridgeError::BindingFailure { stage: BindingStage::ParseDataset, .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_module() {
        let dir = TempDir::new().unwrap();
        let (module, db) = write_sources(dir.path(), &GuestBuilder::new(), "{}");
        std::fs::write(&module, b"\0asm\x01\x00\x00\x00garbage").unwrap();

        let err = load_checker(&module, &db).await.err().unwrap();
        assert!(matches!(
            err,
            BridgeError::BindingFailure { stage: BindingStage::Compile, .. }
        ));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let err = load_checker("ftp://example.com/module.wasm", "db.json")
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BridgeError::BindingFailure { stage: BindingStage::FetchModule, .. }
        ));
    }
}
