//! MQTT broker auth/ACL hooks and threshold monitoring for device telemetry.
pub mod access_control;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod memory_store;
pub mod models;
pub mod mqtt_service;
pub mod notification;
pub mod provisioning;
pub mod rest_server;
pub mod secret;
pub mod service_utils;
pub mod store;
pub mod threshold_cache;
pub mod threshold_engine;
pub mod topic;
