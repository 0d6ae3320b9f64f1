// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Core types shared across the lake: series identity, the dynamic column
//! frame, configuration, retry policy, and task state.

pub mod config;
pub mod frame;
pub mod identity;
pub mod retry;
pub mod task;

pub use frame::{Candle, Column, Frame, FrameError};
pub use identity::{DataKind, SeriesIdentity};
