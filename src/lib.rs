pub mod aggregate;
pub mod archive;
pub mod classify;
pub mod clock;
pub mod config;
pub mod domain;
pub mod entrez;
pub mod error;
pub mod gbif;
pub mod http;
pub mod join;
pub mod output;
pub mod paginate;
pub mod pipeline;
pub mod poll;
pub mod raster;
pub mod store;
pub mod workflow;
