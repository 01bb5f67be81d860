//! Laiska - plant-monitor node firmware
//! OTA update engine and the node's HTTP surface

pub mod engine;
