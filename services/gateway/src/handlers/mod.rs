pub mod devices;
pub mod health;
pub mod temperature;
pub mod ws;
