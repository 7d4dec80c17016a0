use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use anyhow::bail;
use crate::admission::AdmissionPolicy;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// interface the server listens on, all interfaces by default
    pub bind_ip: IpAddr,
    /// 0 for an ephemeral port
    pub port: u16,
    pub max_connections: usize,

    /// A peer that shows no activity for *more* than this is evicted. Activity is received
    ///  data, so a peer that only receives is evicted as well.
    pub idle_timeout: Duration,
    pub admission_policy: AdmissionPolicy,

    /// capacity of a single outbound buffer, i.e. the maximum chunk size for `send` (event-driven)
    pub send_chunk_size: usize,
    /// Number of outbound buffers (event-driven). This bounds the amount of data that can be
    ///  queued for the network thread across *all* connections.
    pub send_pool_size: usize,
    /// period of the idle check on the network thread (event-driven)
    pub poll_interval: Duration,

    /// Receive timeout of worker threads (thread-per-connection). This is also the upper bound
    ///  for the time it takes a worker to notice a close request.
    pub read_timeout: Duration,
    /// accept timeout of the monitor thread (thread-per-connection)
    pub accept_poll_interval: Duration,
    pub recv_buffer_size: usize,
    pub worker_stack_size: Option<usize>,

    pub net_thread_stack_size: Option<usize>,
}

impl ServerConfig {
    pub fn new(port: u16, max_connections: usize) -> ServerConfig {
        ServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port,
            max_connections,
            idle_timeout: Duration::from_secs(20),
            admission_policy: AdmissionPolicy::default(),
            send_chunk_size: 512,
            send_pool_size: 16,
            poll_interval: Duration::from_secs(2),
            read_timeout: Duration::from_secs(1),
            accept_poll_interval: Duration::from_millis(100),
            recv_buffer_size: 1536,
            worker_stack_size: None,
            net_thread_stack_size: None,
        }
    }

    /// config for a server on an ephemeral loopback port, mostly for testing
    pub fn localhost(max_connections: usize) -> ServerConfig {
        ServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::new(0, max_connections)
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.send_chunk_size == 0 {
            bail!("send_chunk_size must not be 0");
        }
        if self.send_pool_size == 0 {
            bail!("send_pool_size must not be 0");
        }
        if self.recv_buffer_size == 0 {
            bail!("recv_buffer_size must not be 0");
        }

        for (name, value) in [
            ("idle_timeout", self.idle_timeout),
            ("poll_interval", self.poll_interval),
            ("read_timeout", self.read_timeout),
            ("accept_poll_interval", self.accept_poll_interval),
        ] {
            if value.is_zero() {
                bail!("{} must not be zero", name);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new(8080, 4);
        assert_eq!(config.bind_addr(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.idle_timeout, Duration::from_secs(20));
        assert_eq!(config.send_chunk_size, 512);
        assert_eq!(config.send_pool_size, 16);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.admission_policy, AdmissionPolicy::RejectBeforeHandshake);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_localhost() {
        let config = ServerConfig::localhost(2);
        assert_eq!(config.bind_addr(), "127.0.0.1:0".parse().unwrap());
        assert_eq!(config.max_connections, 2);
    }

    #[rstest]
    #[case::max_connections(|c: &mut ServerConfig| c.max_connections = 0)]
    #[case::send_chunk_size(|c: &mut ServerConfig| c.send_chunk_size = 0)]
    #[case::send_pool_size(|c: &mut ServerConfig| c.send_pool_size = 0)]
    #[case::recv_buffer_size(|c: &mut ServerConfig| c.recv_buffer_size = 0)]
    #[case::idle_timeout(|c: &mut ServerConfig| c.idle_timeout = Duration::ZERO)]
    #[case::poll_interval(|c: &mut ServerConfig| c.poll_interval = Duration::ZERO)]
    #[case::read_timeout(|c: &mut ServerConfig| c.read_timeout = Duration::ZERO)]
    #[case::accept_poll_interval(|c: &mut ServerConfig| c.accept_poll_interval = Duration::ZERO)]
    fn test_validate_rejects(#[case] modify: fn(&mut ServerConfig)) {
        let mut config = ServerConfig::new(0, 1);
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
