// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use tide_core::init_tracing;
use tide_platform::WinitSurface;
use tide_render::{run_present_loop, CapabilitySurface, RenderSize};
use tide_render_vk::{FramePacing, VkConfig, VkPresenter};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file with a [present] table
    #[arg(long, default_value = "tide.toml")]
    config: PathBuf,

    /// Load the Khronos validation layer
    #[arg(long)]
    validation: bool,

    #[arg(long)]
    frames_in_flight: Option<usize>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    #[arg(long, value_enum)]
    pacing: Option<PacingCfg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
enum PacingCfg {
    #[default]
    QueueIdle,
    Pipelined,
}

impl From<PacingCfg> for FramePacing {
    fn from(p: PacingCfg) -> Self {
        match p {
            PacingCfg::QueueIdle => FramePacing::QueueIdle,
            PacingCfg::Pipelined => FramePacing::Pipelined,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
struct PresentCfg {
    enable_diagnostic_layers: bool,
    max_frames_in_flight: usize,
    requested_extent: [u32; 2],
    clear_color: [f32; 4],
    pacing: PacingCfg,
    title: String,
}

impl Default for PresentCfg {
    fn default() -> Self {
        let vk = VkConfig::default();
        PresentCfg {
            enable_diagnostic_layers: vk.enable_diagnostics,
            max_frames_in_flight: vk.max_frames_in_flight,
            requested_extent: [vk.requested_extent.width, vk.requested_extent.height],
            clear_color: vk.clear_color,
            pacing: PacingCfg::QueueIdle,
            title: "Real Time Water Simulation".to_owned(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct AppCfg {
    #[serde(default)]
    present: PresentCfg,
}

impl AppCfg {
    fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// A missing file means defaults; anything unreadable or malformed is an error.
    fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).with_context(|| format!("parsing {}", path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("{} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn apply_args(&mut self, args: &Args) {
        let p = &mut self.present;
        if args.validation {
            p.enable_diagnostic_layers = true;
        }
        if let Some(n) = args.frames_in_flight {
            p.max_frames_in_flight = n;
        }
        if let Some(w) = args.width {
            p.requested_extent[0] = w;
        }
        if let Some(h) = args.height {
            p.requested_extent[1] = h;
        }
        if let Some(pacing) = args.pacing {
            p.pacing = pacing;
        }
    }

    fn vk_config(&self) -> Result<VkConfig> {
        let p = &self.present;
        if p.max_frames_in_flight == 0 {
            bail!("max_frames_in_flight must be at least 1");
        }
        let [width, height] = p.requested_extent;
        if width == 0 || height == 0 {
            bail!("requested_extent must be non-zero, got {width}x{height}");
        }
        Ok(VkConfig {
            enable_diagnostics: p.enable_diagnostic_layers,
            max_frames_in_flight: p.max_frames_in_flight,
            requested_extent: RenderSize::new(width, height),
            clear_color: p.clear_color,
            pacing: p.pacing.into(),
        })
    }
}

fn run(args: &Args) -> Result<()> {
    let mut cfg = AppCfg::load(&args.config)?;
    cfg.apply_args(args);
    let vk_cfg = cfg.vk_config()?;
    info!("config: {vk_cfg:?}");

    let mut surface = WinitSurface::open(&cfg.present.title, vk_cfg.requested_extent)?;
    let size = surface.size();

    let mut presenter = VkPresenter::new(&surface, &surface, size, vk_cfg)?;

    let result = run_present_loop(&mut surface, &mut presenter);

    // GPU objects go before the window they present to
    drop(presenter);
    drop(surface);

    let frames = result?;
    info!("exit after {frames} frame(s)");
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    run(&args)
}
