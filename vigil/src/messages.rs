/// Standardise how messages are sent into and out of
/// the edge system. Provide test suite to ensure
/// interfaces are respected.
pub mod control {
    /// Light messages come from the analysis and sensor loops and
    /// are consumed by the light arbiter.
    pub mod light;
}

/// Packet kinds, the typed envelope and the payloads it carries.
pub mod packet;
/// Two stage envelope codec shared by the producer and the viewer.
pub mod codec;
