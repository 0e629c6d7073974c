pub mod fit;
pub mod fit_settings;
pub mod levmar;
pub mod main_fitter;
pub mod models;
pub mod parameters;
