pub mod dns;

use crate::config::RewriterConfig;
use crate::rewrite::dns::DnsRewriter;
use std::net::Ipv4Addr;

/// A pure transformation over a raw IP packet
///
/// `rewrite` returns the replacement bytes, `Ok(None)` to pass the packet
/// through unchanged, or an error, which the chain swallows. `sweep` is
/// called from the owning session's maintenance tick for implementations
/// that keep time-bounded state.
pub trait Rewriter: Send {
    fn name(&self) -> &str;

    fn rewrite(&mut self, packet: &[u8]) -> crate::Result<Option<Vec<u8>>>;

    fn sweep(&mut self) {}
}

/// Folds a payload through the chain
///
/// Each rewriter sees the output of the last successful one; failures are
/// logged and never propagate to the peer or the device.
pub fn apply_chain(rewriters: &mut [Box<dyn Rewriter>], payload: Vec<u8>) -> Vec<u8> {
    let mut data = payload;
    for rewriter in rewriters.iter_mut() {
        match rewriter.rewrite(&data) {
            Ok(Some(replaced)) => data = replaced,
            Ok(None) => {}
            Err(e) => tracing::warn!("rewriter {} failed: {}", rewriter.name(), e),
        }
    }
    data
}

const DEFAULT_NAMESERVER: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

pub fn build_rewriter(config: &RewriterConfig) -> crate::Result<Box<dyn Rewriter>> {
    match config.class.as_str() {
        "dns" => {
            let nameserver = config.force_nameserver.unwrap_or_else(|| {
                tracing::warn!("using default nameserver {}", DEFAULT_NAMESERVER);
                DEFAULT_NAMESERVER
            });
            Ok(Box::new(DnsRewriter::new(nameserver)))
        }
        other => Err(format!("unknown rewriter class: {}", other).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Suffixer(u8);

    impl Rewriter for Suffixer {
        fn name(&self) -> &str {
            "suffixer"
        }

        fn rewrite(&mut self, packet: &[u8]) -> crate::Result<Option<Vec<u8>>> {
            let mut data = packet.to_vec();
            data.push(self.0);
            Ok(Some(data))
        }
    }

    struct Failing;

    impl Rewriter for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn rewrite(&mut self, _packet: &[u8]) -> crate::Result<Option<Vec<u8>>> {
            Err("boom".into())
        }
    }

    struct PassThrough;

    impl Rewriter for PassThrough {
        fn name(&self) -> &str {
            "pass-through"
        }

        fn rewrite(&mut self, _packet: &[u8]) -> crate::Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    #[test]
    fn chain_folds_in_order() {
        let mut chain: Vec<Box<dyn Rewriter>> = vec![Box::new(Suffixer(1)), Box::new(Suffixer(2))];
        assert_eq!(apply_chain(&mut chain, vec![0]), vec![0, 1, 2]);
    }

    #[test]
    fn failing_rewriter_leaves_payload_unchanged() {
        let mut chain: Vec<Box<dyn Rewriter>> = vec![Box::new(Failing)];
        assert_eq!(apply_chain(&mut chain, vec![1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn failure_continues_with_last_successful_payload() {
        let mut chain: Vec<Box<dyn Rewriter>> = vec![
            Box::new(Suffixer(1)),
            Box::new(Failing),
            Box::new(Suffixer(2)),
        ];
        assert_eq!(apply_chain(&mut chain, vec![0]), vec![0, 1, 2]);
    }

    #[test]
    fn pass_through_keeps_running_payload() {
        let mut chain: Vec<Box<dyn Rewriter>> = vec![Box::new(PassThrough)];
        assert_eq!(apply_chain(&mut chain, vec![9, 9]), vec![9, 9]);
    }

    #[test]
    fn unknown_class_is_an_error() {
        let config = RewriterConfig {
            class: "no-such-rewriter".to_string(),
            force_nameserver: None,
        };
        assert!(build_rewriter(&config).is_err());
    }
}
