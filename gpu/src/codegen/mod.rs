//! Shader source generation.
//!
//! Turns the buffer table of a thread context into the GLSL declarations
//! that are prepended to user compute shaders.

pub mod glsl;
