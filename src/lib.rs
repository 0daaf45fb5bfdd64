//! # Water Heater Simulator
//!
//! Simulates the water temperature of an electric water heater in continuous
//! time and exposes live control and status over a line-based TCP protocol.
//!
//! ## Features
//!
//! - **Continuous-time thermal model**: heating by electric power, Newton
//!   cooling towards the environment, automatic cut-off at boiling point
//! - **Background update loop**: a dedicated thread integrating every ~100 µs
//! - **Concurrent sessions**: any number of clients observe and control the
//!   same simulation
//! - **Periodic status push**: every client receives a status line at a
//!   configurable interval
//!
//! ## Quick Start
//!
//! ```rust
//! use waterheater::simulation::{Mode, Simulation, SimulationParams};
//!
//! let params = SimulationParams::new(200_000.0, 2000.0, 20.0, 20.0);
//! let sim = Simulation::new(params).unwrap();
//! sim.start().unwrap();
//! sim.set_mode(Mode::Heating);
//!
//! let snapshot = sim.snapshot();
//! println!("{} °C", snapshot.water_temp_c);
//!
//! sim.stop();
//! sim.join();
//! ```
//!
//! ## Architecture
//!
//! - [`clock`] - Nanosecond wall-clock source
//! - [`simulation`] - Thermal model and update loop
//! - [`protocol`] - Line protocol parsing and formatting
//! - [`session`] - Per-connection command handler and status broadcaster
//! - [`server`] - Connection acceptor
//! - [`config`] - Command-line configuration and defaults

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod clock;
pub mod config;
pub mod protocol;
pub mod server;
pub mod session;
pub mod simulation;

pub use config::Config;
pub use server::Server;
pub use session::Session;
pub use simulation::{Mode, Simulation, SimulationParams, Snapshot};
