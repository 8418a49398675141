use std::fs;
use std::path::Path;

use cf_core::{SNAPSHOT_VERSION, export_json, import_json};

use crate::error::{Result, StoreError};
use crate::store::Store;

impl Store {
    /// Replace the stored field with a JSON snapshot file.
    pub fn import_json_file(&self, path: &Path) -> Result<()> {
        let json = fs::read_to_string(path).map_err(|e| {
            StoreError::InvalidData(format!("failed to read {}: {e}", path.display()))
        })?;
        self.import_json_str(&json)
    }

    pub fn import_json_str(&self, json: &str) -> Result<()> {
        let snapshot =
            import_json(json).map_err(|e| StoreError::InvalidData(format!("invalid JSON: {e}")))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StoreError::InvalidData(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        self.replace_snapshot(&snapshot)
    }

    pub fn export_json_file(&self, path: &Path) -> Result<()> {
        let json = self.export_json_string()?;
        fs::write(path, json).map_err(|e| {
            StoreError::InvalidData(format!("failed to write {}: {e}", path.display()))
        })
    }

    pub fn export_json_string(&self) -> Result<String> {
        let snapshot = self.load_snapshot()?;
        export_json(&snapshot)
            .map_err(|e| StoreError::InvalidData(format!("JSON export failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::{EngineConfig, ExcitationEvent, FieldEngine, Location};
    use uuid::Uuid;

    fn make_engine() -> FieldEngine {
        let mut engine = FieldEngine::with_seed(EngineConfig::default(), 42);
        engine
            .excite(ExcitationEvent::new(Location::Grid([0, 0, 0]), 1.0).with_entity(Uuid::new_v4()))
            .unwrap();
        engine
            .excite(ExcitationEvent::new(Location::Continuous([0.5, -0.25, 0.0]), 0.4))
            .unwrap();
        engine.tick(None).unwrap();
        engine
    }

    #[test]
    fn test_import_export_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.save_snapshot(&make_engine().snapshot()).unwrap();
        let exported = store.export_json_string().unwrap();

        let other = Store::open_in_memory().unwrap();
        other.import_json_str(&exported).unwrap();
        assert_eq!(other.load_snapshot().unwrap(), store.load_snapshot().unwrap());
    }

    #[test]
    fn test_import_rejects_garbage() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.import_json_str("not json").is_err());
    }

    #[test]
    fn test_import_rejects_unknown_version() {
        let store = Store::open_in_memory().unwrap();
        let mut snapshot = make_engine().snapshot();
        snapshot.version = SNAPSHOT_VERSION + 1;
        let json = export_json(&snapshot).unwrap();
        let err = store.import_json_str(&json).unwrap_err();
        assert!(err.to_string().contains("unsupported snapshot version"));
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.json");
        let store = Store::open_in_memory().unwrap();
        store.save_snapshot(&make_engine().snapshot()).unwrap();
        store.export_json_file(&path).unwrap();

        let other = Store::open_in_memory().unwrap();
        other.import_json_file(&path).unwrap();
        assert_eq!(
            other.load_snapshot().unwrap().cells,
            store.load_snapshot().unwrap().cells
        );
    }

    #[test]
    fn test_import_missing_file() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.import_json_file(Path::new("/nonexistent/field.json")).is_err());
    }
}
