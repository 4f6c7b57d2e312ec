//! Server descriptor validation.
//!
//! Applied by the registry on add and update. Checks are explicit per field,
//! and each failure names the field path and the validator that rejected it.
//! Fields a dialect disables via `server:<field>` are removed from the schema
//! before validation, so e.g. a SQLite descriptor is not required to carry an
//! address or credentials.

use crate::error::{GatewayError, Result};
use crate::models::server::{Client, Server};

/// Validate a descriptor against the registered dialects.
pub fn validate_server(server: &Server) -> Result<()> {
    if server.name.trim().is_empty() {
        return Err(GatewayError::validation(
            "name",
            "required",
            "name must not be empty",
        ));
    }

    let key = server.client.trim();
    if key.is_empty() {
        return Err(GatewayError::validation(
            "client",
            "required",
            "client must not be empty",
        ));
    }
    let client = Client::find(key).ok_or_else(|| {
        GatewayError::validation(
            "client",
            "oneOf",
            format!("unknown client `{key}`; expected one of the registered adapters"),
        )
    })?;

    let enabled = |field: &str| !client.is_disabled(&format!("server:{field}"));

    if enabled("ssl") && server.ssl.is_none() {
        return Err(GatewayError::validation(
            "ssl",
            "required",
            "ssl must be set (true or false)",
        ));
    }

    validate_address(server, &enabled)?;

    if enabled("ssh") {
        if let Some(ssh) = &server.ssh {
            validate_ssh(ssh)?;
        }
    }

    Ok(())
}

/// Exactly one of (host, port) or socket_path, unless the dialect disables
/// the address fields entirely.
fn validate_address(server: &Server, enabled: &dyn Fn(&str) -> bool) -> Result<()> {
    let host_enabled = enabled("host") && enabled("port");
    let socket_enabled = enabled("socketPath");
    if !host_enabled && !socket_enabled {
        return Ok(());
    }

    let has_host = server.host.as_deref().is_some_and(|h| !h.is_empty());
    let has_port = server.port.is_some();
    let has_socket = server
        .socket_path
        .as_deref()
        .is_some_and(|p| !p.is_empty());

    if has_socket && (has_host || has_port) {
        return Err(GatewayError::validation(
            "socketPath",
            "exclusive",
            "socketPath cannot be combined with host/port",
        ));
    }
    if has_socket {
        return Ok(());
    }
    if !has_host && !has_port {
        return Err(GatewayError::validation(
            "host",
            "required",
            "either host and port or socketPath must be set",
        ));
    }
    if has_host != has_port {
        let (field, missing) = if has_host {
            ("port", "port is required when host is set")
        } else {
            ("host", "host is required when port is set")
        };
        return Err(GatewayError::validation(field, "required", missing));
    }
    Ok(())
}

fn validate_ssh(ssh: &crate::models::server::SshConfig) -> Result<()> {
    if ssh.host.trim().is_empty() {
        return Err(GatewayError::validation(
            "ssh.host",
            "required",
            "ssh host must not be empty",
        ));
    }
    if ssh.port == 0 {
        return Err(GatewayError::validation(
            "ssh.port",
            "integer",
            "ssh port must be between 1 and 65535",
        ));
    }
    if ssh.user.trim().is_empty() {
        return Err(GatewayError::validation(
            "ssh.user",
            "required",
            "ssh user must not be empty",
        ));
    }
    let has_password = ssh.password.as_deref().is_some_and(|p| !p.is_empty());
    let has_key = ssh.private_key.as_deref().is_some_and(|k| !k.is_empty());
    if !has_password && !has_key {
        return Err(GatewayError::validation(
            "ssh.password",
            "or",
            "ssh requires a password or a privateKey",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::server::SshConfig;

    fn base() -> Server {
        Server {
            id: None,
            name: "local".into(),
            client: "postgresql".into(),
            host: Some("127.0.0.1".into()),
            port: Some(5432),
            socket_path: None,
            database: None,
            schema: None,
            user: Some("postgres".into()),
            password: None,
            ssl: Some(false),
            ssh: None,
            encrypted: false,
        }
    }

    fn field_of(err: GatewayError) -> String {
        match err {
            GatewayError::Validation { field, .. } => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_descriptor_passes() {
        assert!(validate_server(&base()).is_ok());
    }

    #[test]
    fn test_name_required() {
        let mut s = base();
        s.name = "   ".into();
        assert_eq!(field_of(validate_server(&s).unwrap_err()), "name");
    }

    #[test]
    fn test_unknown_client_rejected() {
        let mut s = base();
        s.client = "oracle".into();
        let err = validate_server(&s).unwrap_err();
        assert_eq!(err.validator(), Some("oneOf"));
    }

    #[test]
    fn test_ssl_required() {
        let mut s = base();
        s.ssl = None;
        assert_eq!(field_of(validate_server(&s).unwrap_err()), "ssl");
    }

    #[test]
    fn test_host_requires_port() {
        let mut s = base();
        s.port = None;
        assert_eq!(field_of(validate_server(&s).unwrap_err()), "port");
    }

    #[test]
    fn test_port_requires_host() {
        let mut s = base();
        s.host = None;
        assert_eq!(field_of(validate_server(&s).unwrap_err()), "host");
    }

    #[test]
    fn test_neither_address_form_rejected() {
        let mut s = base();
        s.host = None;
        s.port = None;
        assert!(validate_server(&s).is_err());
    }

    #[test]
    fn test_socket_path_excludes_host() {
        let mut s = base();
        s.client = "mysql".into();
        s.socket_path = Some("/var/run/mysqld.sock".into());
        assert_eq!(field_of(validate_server(&s).unwrap_err()), "socketPath");
    }

    #[test]
    fn test_socket_path_alone_is_valid() {
        let mut s = base();
        s.client = "mysql".into();
        s.host = None;
        s.port = None;
        s.socket_path = Some("/var/run/mysqld.sock".into());
        assert!(validate_server(&s).is_ok());
    }

    #[test]
    fn test_sqlite_skips_disabled_fields() {
        let s = Server {
            name: "file db".into(),
            client: "sqlite".into(),
            database: Some("/tmp/app.db".into()),
            ..Default::default()
        };
        assert!(validate_server(&s).is_ok());
    }

    #[test]
    fn test_ssh_requires_credentials() {
        let mut s = base();
        s.ssh = Some(SshConfig {
            host: "bastion".into(),
            port: 22,
            user: "deploy".into(),
            password: None,
            private_key: None,
            passphrase: None,
            use_passphrase: false,
        });
        let err = validate_server(&s).unwrap_err();
        assert_eq!(err.validator(), Some("or"));
    }

    #[test]
    fn test_ssh_zero_port_rejected() {
        let mut s = base();
        s.ssh = Some(SshConfig {
            host: "bastion".into(),
            port: 0,
            user: "deploy".into(),
            password: Some("p".into()),
            private_key: None,
            passphrase: None,
            use_passphrase: false,
        });
        assert_eq!(field_of(validate_server(&s).unwrap_err()), "ssh.port");
    }

    #[test]
    fn test_ssh_private_key_is_enough() {
        let mut s = base();
        s.ssh = Some(SshConfig {
            host: "bastion".into(),
            port: 22,
            user: "deploy".into(),
            password: None,
            private_key: Some("/home/u/.ssh/id_ed25519".into()),
            passphrase: None,
            use_passphrase: false,
        });
        assert!(validate_server(&s).is_ok());
    }
}
