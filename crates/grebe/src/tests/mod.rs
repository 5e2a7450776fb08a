pub mod utils;

mod integration;
