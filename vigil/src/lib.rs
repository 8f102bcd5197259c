/**
The vigil edge system streams camera frames, vision-model verdicts and ambient
light readings from a producer process to a viewer process over one UDP channel,
and arbitrates a three colour indicator light that both the verdicts and the
light sensor want to drive. As with other small control systems, functionality
is split into devices (atomic hardware or software units) and components
(devices grouped into something that performs a job for the system), with thin
binaries under `systems/` that only parse a config path and start a component.
*/

/// Components in the system are created by grouping together
/// devices into a logical unit that performs some function
/// for the overall edge system.
pub mod components;
/// Devices that are an atomic unit, and can be composed
/// with other devices into components to perform some function.
pub mod devices;
/// Error taxonomy shared by the devices and components.
pub mod error;
/// Tracing subscriber set up for the binaries.
pub mod logging;
/// Message structure for communication into and out of the
/// edge system: the multiplexed wire protocol and light control.
pub mod messages;
/// Development utilities for working with serialisation and
/// image information.
pub mod utils;
