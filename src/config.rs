use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a single outbound endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Capacity of the outbound queue. A cast against a full queue fails.
    pub queue_capacity: usize,

    /// Buffer between the drain loop and the gRPC request stream.
    pub stream_buffer: usize,

    /// Timeout for dialing the remote gateway.
    pub dial_timeout: Duration,

    /// How many times opening the stream is retried after the first failure.
    pub stream_open_retries: u32,

    /// Delay between stream open attempts.
    pub stream_retry_delay: Duration,

    /// Delay before reconnecting after the receive loop observed a break.
    pub reconnect_delay: Duration,

    /// Timeout for unary requests.
    pub request_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2048,
            stream_buffer: 64,
            dial_timeout: Duration::from_secs(5),
            stream_open_retries: 3,
            stream_retry_delay: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl EndpointConfig {
    /// Set the outbound queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the stream open retry bound and the delay between attempts.
    pub fn with_stream_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.stream_open_retries = retries;
        self.stream_retry_delay = delay;
        self
    }

    /// Set the delay before an automatic reconnect.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the unary request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Configuration for the endpoint registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval of the liveness sweep that reconnects broken endpoints.
    pub sweep_interval: Duration,

    /// Configuration handed to every endpoint.
    pub endpoint: EndpointConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            endpoint: EndpointConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Set the liveness sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the per-endpoint configuration.
    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }
}

/// Configuration for the hosted gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the gRPC server listens on.
    pub listen_addr: SocketAddr,

    /// Capacity of each node session's outbound queue.
    pub queue_capacity: usize,

    /// Buffer between a session's drain loop and the gRPC response stream.
    pub stream_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7100)),
            queue_capacity: 2048,
            stream_buffer: 64,
        }
    }
}

impl GatewayConfig {
    /// Create a config listening on the given address.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    /// Set the per-session outbound queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the response stream buffer.
    pub fn with_stream_buffer(mut self, buffer: usize) -> Self {
        self.stream_buffer = buffer;
        self
    }
}
