pub mod app;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod connect;
pub mod convert;
pub mod daris;
pub mod domain;
pub mod download;
pub mod error;
pub mod fs_util;
pub mod matching;
pub mod netrc;
pub mod output;
pub mod upload;
pub mod xnat;
