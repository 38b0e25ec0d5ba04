//! # PAC for the DesignWare mobile storage host controller
//!
//! Register definitions for the Synopsys DesignWare MMC/SD/SDIO host controller ("MSHC"), as
//! found in a variety of SoCs. The controller is not at a fixed address, so the register block
//! is always created with the base address supplied by the platform.
#![no_std]

pub mod mshc;
pub use mshc::*;
