pub mod workflow;
pub mod features;
pub mod similarity;
pub mod patterns;
pub mod temporal;
pub mod correlation;
pub mod analyzers;
pub mod recommend;
pub mod summary;
pub mod changes;
pub mod learning;
pub mod alerts;
pub mod store;
pub mod webhook;
pub mod scheduler;
pub mod service;
pub mod config;
