//! Request bodies specific to the control API. Response shapes mostly reuse
//! the domain models directly.

use serde::Deserialize;

use crate::database::models::PortableServer;

/// `POST /import` accepts either a bare array or an export-file object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ImportBody {
    Wrapped { servers: Vec<PortableServer> },
    Bare(Vec<PortableServer>),
}

impl ImportBody {
    pub fn into_servers(self) -> Vec<PortableServer> {
        match self {
            Self::Wrapped { servers } => servers,
            Self::Bare(servers) => servers,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddProfileRequest {
    pub server_id: String,
    pub display_name: String,
    #[serde(default)]
    pub socks_port_override: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportQuery {
    #[serde(default)]
    pub include_keys: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub period: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_body_accepts_both_shapes() {
        let bare = r#"[{"name":"n","host":"h","username":"u","authType":"password"}]"#;
        let body: ImportBody = serde_json::from_str(bare).unwrap();
        assert_eq!(body.into_servers().len(), 1);

        let wrapped =
            r#"{"servers":[{"name":"n","host":"h","username":"u","authType":"password"}]}"#;
        let body: ImportBody = serde_json::from_str(wrapped).unwrap();
        assert_eq!(body.into_servers().len(), 1);
    }
}
