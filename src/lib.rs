pub mod args;
pub mod capture;
pub mod complex;
pub mod config;
pub mod error;
pub mod f_engine;
pub mod graticule;
pub mod monitoring;
pub mod pipeline;
pub mod range;
pub mod rig;
pub mod source;
pub mod waterfall;
