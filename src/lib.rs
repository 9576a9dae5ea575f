#![no_std]

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as EmbMutex;

pub mod bme680;
pub mod exporter;
#[cfg(feature = "rp2040")]
pub mod http;
pub mod sampler;

pub type Mutex<T> = EmbMutex<CriticalSectionRawMutex, T>;

#[cfg(feature = "rp2040")]
pub type I2c0 =
    embassy_rp::i2c::I2c<'static, embassy_rp::peripherals::I2C0, embassy_rp::i2c::Async>;
