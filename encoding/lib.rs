#![deny(dead_code)]
#![deny(unused_imports)]

pub mod analysis;
pub mod config;
pub mod data;
pub mod folds;
pub mod logbook;
pub mod maps;
pub mod permutation;
pub mod ridge;
pub mod score;
