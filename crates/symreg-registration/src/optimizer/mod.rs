//! Optimisation helpers for the linear engine.

pub mod combiner;
pub mod gradient_descent;

pub use combiner::GradientCombiner;
pub use gradient_descent::GradientDescent;
