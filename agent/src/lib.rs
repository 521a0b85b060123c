// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

pub mod cloud;
pub mod config;
pub mod device_store;
pub mod dispatcher;
pub mod error;
pub mod event_buffer;
pub mod onvif;
pub mod orchestrator;
pub mod rtsp;
pub mod scanner;
pub mod stream_store;
pub mod transcoder;
pub mod uplink;
