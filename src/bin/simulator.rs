use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, Level};
use waterheater::config::Config;
use waterheater::server::Server;
use waterheater::simulation::Simulation;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match Config::from_args() {
        Ok(config) => config,
        Err(e) => e.exit(),
    };

    let level = if config.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("*******************************************");
    info!("* Water Heating Simulation v0.1.0");
    info!("*******************************************");
    info!("Network Port: {}", config.server.port);
    info!("Status Update Interval: {} ms", config.server.status_interval.as_millis());
    info!("Simulation Power: {:.1} W", config.simulation.heater_power_w);
    info!("Simulation Env. Temperature: {:.1} °C", config.simulation.ambient_temp_c);
    info!("Simulation Water Volume: {:.1} l", config.simulation.water_volume_l);
    info!("*******************************************");

    let sim = Arc::new(Simulation::new(config.simulation.params()).map_err(|e| {
        error!("error creating simulation: {}", e);
        e
    })?);

    let server = Server::bind(config.server.clone(), Arc::clone(&sim)).map_err(|e| {
        error!("error opening socket: {}", e);
        e
    })?;

    if let Err(e) = sim.start() {
        error!("error starting simulation: {}", e);
        return Err(e.into());
    }

    let result = tokio::select! {
        result = server.run() => result,
        _ = signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    };

    sim.stop();
    sim.join();
    info!("Simulation terminated!");

    result.map_err(Into::into)
}
