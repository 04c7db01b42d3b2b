//! Core library for the illumination calibration application.
//!
//! Maps a requested sample power to actuator settings (attenuator control value and
//! laser power set-point) by inverting fitted attenuation curves.
//!
//! - `analysis`: invertible curve models and the fitting routines behind them
//! - `storage`: the time-versioned calibration table
//! - `calibration`: sweep protocols that measure, fit and persist curves
//! - `control`: the power-control engine selecting laser power buckets
//! - `hardware`: capability traits, simulated devices and the driver registry
//! - `config`: figment-based settings

pub mod analysis;
pub mod calibration;
pub mod config;
pub mod control;
pub mod error;
pub mod hardware;
pub mod storage;

pub use error::{AppResult, IlluminationError};
