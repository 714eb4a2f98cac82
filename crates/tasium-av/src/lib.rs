pub mod dumper;
pub mod mixer;
pub mod pump;
pub mod resampler;
pub mod tscc;
pub mod vu;
