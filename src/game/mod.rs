pub mod constants;
pub mod grid;
pub mod bounds;
pub mod capture;
pub mod worker;
pub mod player;
pub mod input_buffer;
pub mod score;
pub mod state;
