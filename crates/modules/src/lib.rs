// SPDX-FileCopyrightText: © 2025 Castflow Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Castflow Modules - Built-in processing modules.
//!
//! - [`regulator`]: time-aligned dispatch (mono and multi-stream)
//! - [`rectifier`]: sample-accurate resynchronization and framerate
//!   conversion
//! - [`adaptive`]: DASH/HLS segmenting and manifest writing
//! - [`gen`]: procedural sources for exercising pipelines
//! - [`utils`]: the `Recorder` inspection sink
//!
//! Codec, demux, mux and transport modules are external collaborators and
//! live in their own crates; they plug in through the same port contract.

pub mod adaptive;
pub mod gen;
pub mod rectifier;
pub mod regulator;
pub mod utils;

use castflow_core::error::Result;
use castflow_core::ModuleRegistry;

/// Register every built-in module kind.
pub fn register_modules(registry: &mut ModuleRegistry) -> Result<()> {
    gen::SoundGenerator::register(registry)?;
    gen::VideoGenerator::register(registry)?;
    regulator::RegulatorMono::register(registry)?;
    regulator::RegulatorMulti::register(registry)?;
    rectifier::TimeRectifier::register(registry)?;
    adaptive::dasher::Dasher::register(registry)?;
    adaptive::hls::AppleHls::register(registry)?;

    tracing::info!("finished registering built-in modules");
    Ok(())
}
