/// Components that run on the edge unit, on either side of the
/// UDP channel.
pub mod edge {
    /// Latest value cache, one per packet kind.
    pub mod cache;
    /// Auxiliary receiver for free form chart documents.
    pub mod chart;
    /// Receive loop and per kind demultiplexing.
    pub mod multiplexer;
    /// Serialised access to the indicator light.
    pub mod arbiter;
    /// Interval gated dispatch of vision-model calls.
    pub mod scheduler;
    /// Periodic read of the ambient light sensor.
    pub mod sensor_poller;
    /// Producer side composition of the edge components.
    pub mod streamer;
    /// Fire and forget UDP sender.
    pub mod transport;
}

/// Helpful prelude when working with components.
pub mod prelude {
    pub use crate::components::edge::arbiter::*;
    pub use crate::components::edge::multiplexer::*;
    pub use crate::components::edge::streamer::*;
}
