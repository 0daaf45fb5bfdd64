//! Command-line configuration for the simulator.

use crate::simulation::SimulationParams;
use clap::{App, AppSettings, Arg, ArgMatches};
use std::ffi::OsString;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4242;
pub const DEFAULT_BACKLOG: u32 = 3;
pub const DEFAULT_INTERVAL_MS: u64 = 500;
pub const DEFAULT_POWER_W: f64 = 2000.0;
pub const DEFAULT_TEMPERATURE_C: f64 = 20.0;
pub const DEFAULT_VOLUME_L: f64 = 200.0;
pub const GRAMS_PER_LITER: f64 = 1000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub backlog: u32,
    pub status_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            status_interval: Duration::from_millis(DEFAULT_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub heater_power_w: f64,
    /// Environment temperature, also used as the initial water temperature.
    pub ambient_temp_c: f64,
    pub water_volume_l: f64,
}

impl SimulationConfig {
    pub fn params(&self) -> SimulationParams {
        SimulationParams::new(
            self.water_volume_l * GRAMS_PER_LITER,
            self.heater_power_w,
            self.ambient_temp_c,
            self.ambient_temp_c,
        )
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            heater_power_w: DEFAULT_POWER_W,
            ambient_temp_c: DEFAULT_TEMPERATURE_C,
            water_volume_l: DEFAULT_VOLUME_L,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    pub verbose: bool,
    pub server: ServerConfig,
    pub simulation: SimulationConfig,
}

impl Config {
    pub fn from_args() -> Result<Self, clap::Error> {
        Self::parse_from(std::env::args_os())
    }

    pub fn parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = app().get_matches_from_safe(args)?;
        Self::from_matches(&matches)
    }

    fn from_matches(matches: &ArgMatches<'_>) -> Result<Self, clap::Error> {
        let defaults = Self::default();
        Ok(Self {
            verbose: matches.is_present("verbose"),
            server: ServerConfig {
                port: value_or(matches, "port", defaults.server.port)?,
                backlog: defaults.server.backlog,
                status_interval: Duration::from_millis(value_or(
                    matches,
                    "interval",
                    DEFAULT_INTERVAL_MS,
                )?),
            },
            simulation: SimulationConfig {
                heater_power_w: value_or(matches, "power", defaults.simulation.heater_power_w)?,
                ambient_temp_c: value_or(
                    matches,
                    "temperature",
                    defaults.simulation.ambient_temp_c,
                )?,
                water_volume_l: value_or(matches, "volume", defaults.simulation.water_volume_l)?,
            },
        })
    }
}

fn value_or<T>(matches: &ArgMatches<'_>, name: &str, default: T) -> Result<T, clap::Error>
where
    T: std::str::FromStr,
{
    match matches.value_of(name) {
        Some(raw) => raw.parse::<T>().map_err(|_| {
            clap::Error::with_description(
                &format!("invalid value '{}' for --{}", raw, name),
                clap::ErrorKind::InvalidValue,
            )
        }),
        None => Ok(default),
    }
}

fn validate_positive(v: String) -> Result<(), String> {
    match v.parse::<f64>() {
        Ok(n) if n.is_finite() && n > 0.0 => Ok(()),
        _ => Err("value must be a positive number".into()),
    }
}

fn validate_finite(v: String) -> Result<(), String> {
    match v.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(()),
        _ => Err("value must be a number".into()),
    }
}

fn app() -> App<'static, 'static> {
    // -V is taken by --Volume
    App::new("waterheater-sim")
        .setting(AppSettings::DisableVersion)
        .about("Water heating simulation with a line-based TCP control protocol")
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Explain what is being done"),
        )
        .arg(
            Arg::with_name("interval")
                .short("i")
                .long("interval")
                .value_name("MS")
                .help("Status message interval in ms [default: 500]")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(ms) if ms > 0 => Ok(()),
                    _ => Err("Interval must be a positive number of milliseconds".into()),
                }),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Port for incoming connections [default: 4242]")
                .takes_value(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be between 0 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("power")
                .short("P")
                .long("Power")
                .value_name("WATT")
                .help("Heating power in Watt [default: 2000]")
                .takes_value(true)
                .validator(validate_finite),
        )
        .arg(
            Arg::with_name("temperature")
                .short("T")
                .long("Temperature")
                .value_name("CELSIUS")
                .help("Environmental temperature in °C [default: 20]")
                .takes_value(true)
                .allow_hyphen_values(true)
                .validator(validate_finite),
        )
        .arg(
            Arg::with_name("volume")
                .short("V")
                .long("Volume")
                .value_name("LITER")
                .help("Amount of water in l [default: 200]")
                .takes_value(true)
                .validator(validate_positive),
        )
}
