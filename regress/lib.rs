#![deny(dead_code)]
#![deny(unused_imports)]

pub mod firth;
pub mod inference;
pub mod linear;
pub mod logistic;
pub mod model;
