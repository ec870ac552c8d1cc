//! Ember demo viewer
//!
//! Renders a textured quad seen from a camera orbiting around it. The window
//! can be resized or minimized freely; the swapchain follows.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p ember-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `-c, --config <PATH>`: Configuration file (default: `ember.toml` if present)
//! - `-t, --texture <PATH>`: Image to display instead of the checkerboard
//! - `-h, --help`: Print help message
//!
//! ## Keys
//!
//! - `V`: Toggle vsync
//! - `R`: Rebuild the swapchain
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use std::path::{Path, PathBuf};

use anyhow::bail;
use ember_app::{run_app, AppConfig};

use crate::app::Viewer;

const DEFAULT_CONFIG: &str = "ember.toml";

/// Command line options.
#[derive(Debug, Default, PartialEq, Eq)]
struct ViewerArgs {
    config: Option<PathBuf>,
    texture: Option<PathBuf>,
    help: bool,
}

impl ViewerArgs {
    fn parse<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => parsed.help = true,
                "-c" | "--config" => match args.next() {
                    Some(path) => parsed.config = Some(PathBuf::from(path)),
                    None => bail!("{arg} expects a path"),
                },
                "-t" | "--texture" => match args.next() {
                    Some(path) => parsed.texture = Some(PathBuf::from(path)),
                    None => bail!("{arg} expects a path"),
                },
                other => bail!("Unknown argument '{other}', see --help"),
            }
        }

        Ok(parsed)
    }

    /// Configuration from the given file, `ember.toml`, or defaults.
    fn load_config(&self) -> anyhow::Result<AppConfig> {
        let config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None if Path::new(DEFAULT_CONFIG).exists() => AppConfig::load(DEFAULT_CONFIG)?,
            None => AppConfig::new("Ember Viewer"),
        };

        Ok(match &self.texture {
            Some(path) => config.with_texture(path),
            None => config,
        })
    }
}

fn main() -> anyhow::Result<()> {
    let args = ViewerArgs::parse(std::env::args().skip(1))?;
    if args.help {
        print_help();
        return Ok(());
    }

    run_app::<Viewer>(args.load_config()?)
}

fn print_help() {
    println!(
        "Ember Viewer

USAGE:
    cargo run -p ember-viewer -- [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file (default: {DEFAULT_CONFIG} if present)
    -t, --texture <PATH>    Image to display instead of the checkerboard
    -h, --help              Print this help message

KEYS:
    V                       Toggle vsync
    R                       Rebuild the swapchain

SHADERS:
    The viewer loads quad.vert.spv and quad.frag.spv from shader_dir
    (default: shaders). Compile them with:
        glslc shaders/quad.vert -o shaders/quad.vert.spv
        glslc shaders/quad.frag -o shaders/quad.frag.spv

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ViewerArgs> {
        ViewerArgs::parse(args.iter().map(ToString::to_string))
    }

    #[test]
    fn no_arguments() {
        assert_eq!(parse(&[]).unwrap(), ViewerArgs::default());
    }

    #[test]
    fn config_and_texture_paths() {
        let args = parse(&["--config", "demo.toml", "-t", "crate.png"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("demo.toml")));
        assert_eq!(args.texture, Some(PathBuf::from("crate.png")));
        assert!(!args.help);
    }

    #[test]
    fn missing_value_is_an_error() {
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }

    #[test]
    fn texture_flag_overrides_config() {
        let args = ViewerArgs {
            config: None,
            texture: Some(PathBuf::from("override.png")),
            help: false,
        };
        // No ember.toml in the test working directory
        let config = args.load_config().unwrap();
        assert_eq!(config.texture, Some(PathBuf::from("override.png")));
    }
}
