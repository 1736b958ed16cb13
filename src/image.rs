use std::collections::HashMap;

use crate::resources::ports::{parse_service_port, ServicePortDecl};

/// A fully-resolved image reference, e.g. "index.docker.io/x/kernel-python:3.9".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub canonical: String,
    pub short_name: String,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Self {
        let short_name = reference
            .rsplit('/')
            .next()
            .unwrap_or(reference)
            .to_string();
        Self {
            canonical: reference.to_string(),
            short_name,
        }
    }
}

/// Labels consumed from an image, with the deep `ai.backend.*` -> `io.sorna.*`
/// fallback preserved — external kernel images still carry the legacy prefix.
pub fn get_label<'a>(labels: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    labels
        .get(&format!("ai.backend.{key}"))
        .or_else(|| labels.get(&format!("io.sorna.{key}")))
        .map(|s| s.as_str())
}

/// Parse the image's declared service-port list (newline or comma
/// separated `name:protocol:port` entries), skipping malformed lines
/// rather than failing the whole image.
pub fn parse_service_ports_label(raw: &str) -> Vec<ServicePortDecl> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| parse_service_port(entry).ok())
        .collect()
}

/// Derive the container name for a kernel: `kernel.<image-short-name>.<kernel-id>`.
pub fn container_name(image: &ImageRef, kernel_id: &str) -> String {
    format!("kernel.{}.{kernel_id}", image.short_name)
}

/// Recover a kernel-id from a container name, requiring the `kernel.` prefix
/// the reaper and reconciler both depend on.
pub fn kernel_id_from_container_name(name: &str) -> Option<String> {
    let name = name.trim_start_matches('/');
    if !name.starts_with("kernel.") {
        return None;
    }
    name.rsplit_once('.').map(|(_, id)| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_parses_short_name() {
        let img = ImageRef::parse("index.docker.io/x/kernel-python:3.9");
        assert_eq!(img.short_name, "kernel-python:3.9");
    }

    #[test]
    fn get_label_prefers_ai_backend_prefix() {
        let mut labels = HashMap::new();
        labels.insert("ai.backend.version".to_string(), "2".to_string());
        labels.insert("io.sorna.version".to_string(), "1".to_string());
        assert_eq!(get_label(&labels, "version"), Some("2"));
    }

    #[test]
    fn get_label_falls_back_to_io_sorna() {
        let mut labels = HashMap::new();
        labels.insert("io.sorna.version".to_string(), "1".to_string());
        assert_eq!(get_label(&labels, "version"), Some("1"));
    }

    #[test]
    fn get_label_missing_returns_none() {
        let labels = HashMap::new();
        assert_eq!(get_label(&labels, "version"), None);
    }

    #[test]
    fn container_name_pattern() {
        let img = ImageRef::parse("x/kernel-python:3.9");
        assert_eq!(
            container_name(&img, "abc123"),
            "kernel.kernel-python:3.9.abc123"
        );
    }

    #[test]
    fn kernel_id_roundtrip_through_container_name() {
        let img = ImageRef::parse("x/kernel-python:3.9");
        let name = container_name(&img, "abc123");
        assert_eq!(
            kernel_id_from_container_name(&name),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn kernel_id_rejects_non_kernel_prefixed_names() {
        assert_eq!(kernel_id_from_container_name("other-service"), None);
    }

    #[test]
    fn parse_service_ports_label_skips_malformed_entries() {
        let ports = parse_service_ports_label("jupyter:tcp:8080,garbage,web:http:8888");
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].name, "jupyter");
        assert_eq!(ports[1].name, "web");
    }
}
