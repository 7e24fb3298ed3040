//! HTTP surface and configuration of the libvirt exporter binary

pub mod api;
pub mod config;
