//! Notes Core - USB backup pipeline and shared utilities for the notes manager

pub mod config;
pub mod notes;
pub mod power;
pub mod usb;
