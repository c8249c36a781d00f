pub mod cli;
pub mod config;
pub mod remote;
pub mod storage;
pub mod tail;
pub mod web;
