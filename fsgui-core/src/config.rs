use crate::types::NodeConfigBlob;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Top-level shape of the configuration file: a single
/// `nodes` key holding an ordered list of parameter blobs. Grounded on the
/// teacher's `authoring::yaml::parse_workflow_yaml` (`serde_yaml::from_str`
/// into a typed DTO, no manual YAML walking).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub nodes: Vec<NodeConfigBlob>,
}

/// Load a configuration file. A missing or invalid file is not an error —
/// the original's `fsgui/config.py` starts from an empty list in that
/// case, logged at `warn` rather than bubbled up.
pub fn load(path: &Path) -> ConfigFile {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<ConfigFile>(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "config file is invalid YAML, starting with an empty node list"
                );
                ConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "config file missing, starting with an empty node list"
            );
            ConfigFile::default()
        }
    }
}

/// Save atomically: write to a sibling temp file, then rename over the
/// destination.
pub fn save(path: &Path, config: &ConfigFile) -> std::io::Result<()> {
    let yaml = serde_yaml::to_string(config)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("fsgui-config")
    ));

    {
        let mut tmp = std::fs::File::create(&tmp_path)?;
        tmp.write_all(yaml.as_bytes())?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceId;
    use std::collections::BTreeMap;

    #[test]
    fn missing_file_yields_empty_list() {
        let config = load(Path::new("/nonexistent/fsgui-does-not-exist.yaml"));
        assert!(config.nodes.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let config = ConfigFile {
            nodes: vec![NodeConfigBlob {
                type_id: "ripple-envelope".to_string(),
                instance_id: InstanceId::new(),
                nickname: "Ripple detector".to_string(),
                params: BTreeMap::new(),
            }],
        };

        save(&path, &config).unwrap();
        let loaded = load(&path);
        assert_eq!(loaded.nodes.len(), 1);
        assert_eq!(loaded.nodes[0].type_id, "ripple-envelope");
        assert_eq!(loaded.nodes[0].instance_id, config.nodes[0].instance_id);
    }

    #[test]
    fn invalid_yaml_yields_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "not: [valid yaml for this schema: :").unwrap();
        let config = load(&path);
        assert!(config.nodes.is_empty());
    }
}
