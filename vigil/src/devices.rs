/// Devices are the atomic units that can be combined together
/// into components. Their core responsibilities do not change
/// based on location, name etc.
pub mod hardware {
    /// Register level contract of the serial bus.
    pub mod bus;
    /// Frame sources standing in for the camera.
    pub mod camera;
    /// Device interface for the three colour indicator light.
    pub mod light;
    /// Device interface for the ambient light sensor.
    pub mod lux_sensor;
}

/// Devices that live behind a network or process boundary rather
/// than on the serial bus.
pub mod software {
    /// History of verdicts and chat exchanges.
    pub mod store;
    /// Vision-model inference endpoint and verdict strategies.
    pub mod vision;
}
