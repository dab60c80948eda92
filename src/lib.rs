// src/lib.rs

//! reviewsync Collection Library

pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
