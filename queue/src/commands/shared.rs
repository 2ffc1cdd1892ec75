use anyhow::Result;
use serde_json::Value;

use groupq::{GroupqSettings, Queue, load_toml_settings};
use groupq_config::validate_namespace;

pub(crate) fn load_settings(
    config: Option<&str>,
    namespace: Option<&str>,
) -> Result<GroupqSettings> {
    let mut settings = load_toml_settings(config)?;
    if let Some(namespace) = namespace {
        validate_namespace(namespace)?;
        settings.namespace = namespace.to_string();
    }
    Ok(settings)
}

/// The CLI never decodes payloads beyond JSON, so it works on `Value`.
pub(crate) async fn open_queue(
    config: Option<&str>,
    namespace: Option<&str>,
) -> Result<Queue<Value>> {
    let settings = load_settings(config, namespace)?;
    Queue::connect(&settings).await
}

pub(crate) fn parse_payload(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|err| anyhow::anyhow!("payload is not valid JSON: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_payload_accepts_json() {
        assert_eq!(parse_payload(r#"{"n": 1}"#).unwrap(), json!({"n": 1}));
        assert_eq!(parse_payload("42").unwrap(), json!(42));
        assert!(parse_payload("{not json").is_err());
    }

    #[test]
    fn namespace_override_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("groupq.toml");
        std::fs::write(&path, "namespace = \"from-file\"\n").unwrap();
        let path = path.to_str().unwrap();

        let settings = load_settings(Some(path), None).unwrap();
        assert_eq!(settings.namespace, "from-file");
        let settings = load_settings(Some(path), Some("override")).unwrap();
        assert_eq!(settings.namespace, "override");
        assert!(load_settings(Some(path), Some("bad ns")).is_err());
    }
}
