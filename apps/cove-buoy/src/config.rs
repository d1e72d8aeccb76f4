use std::net::SocketAddr;

use anyhow::{Context, Result};

/// Resolve the listening address from `--laddr`, letting a numeric `PORT`
/// environment variable override the port (for platform-assigned ports).
pub fn resolve_listen_addr(laddr: &str) -> Result<SocketAddr> {
    let mut addr: SocketAddr = laddr
        .parse()
        .with_context(|| format!("invalid listen address {laddr}"))?;
    if let Ok(port) = std::env::var("PORT") {
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid PORT value {port}"))?;
        addr.set_port(port);
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_addr() {
        let addr = resolve_listen_addr("0.0.0.0:1337").unwrap();
        assert_eq!(addr.port(), 1337);
    }

    #[test]
    fn rejects_garbage() {
        assert!(resolve_listen_addr("not an addr").is_err());
    }
}
