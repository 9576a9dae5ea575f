#![no_std]
#![no_main]

use cyw43::JoinOptions;
use cyw43_pio::PioSpi;
use embassy_executor::Spawner;
use embassy_rp::peripherals::{DMA_CH0, I2C0, PIO0};
use embassy_rp::{
    bind_interrupts,
    gpio::{Level, Output},
    i2c,
    pio::{InterruptHandler as PioInterruptHandler, Pio},
};
use embassy_time::{Duration, Timer};
use panic_probe as _;
use static_cell::StaticCell;

use core::str::FromStr;
use embassy_net::driver::HardwareAddress;
use embassy_net::{Config as NetConfig, DhcpConfig, Stack};
use embassy_rp::clocks::RoscRng;
use rand_core::RngCore as _;

use defmt::info;
use defmt_rtt as _;

use pico_bme680::bme680::{Bme680Device, BME680_ADDR};
use pico_bme680::exporter::DeviceId;
use pico_bme680::http::{web_task, AppState, WEB_TASK_POOL_SIZE};
use pico_bme680::sampler::Sampler;
use pico_bme680::I2c0;

bind_interrupts!(struct Irqs {
    PIO0_IRQ_0 => PioInterruptHandler<PIO0>;
    I2C0_IRQ => i2c::InterruptHandler<I2C0>;
});

#[embassy_executor::task]
async fn cyw43_task(
    runner: cyw43::Runner<'static, Output<'static>, PioSpi<'static, PIO0, 0, DMA_CH0>>,
) -> ! {
    runner.run().await
}

#[embassy_executor::task]
async fn net_task(mut runner: embassy_net::Runner<'static, cyw43::NetDriver<'static>>) -> ! {
    runner.run().await
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let p = embassy_rp::init(Default::default());

    info!("Booting!");

    // Sensor must be up before any web task is spawned.
    let i2c = i2c::I2c::new_async(p.I2C0, p.PIN_5, p.PIN_4, Irqs, i2c::Config::default());
    let sensor = match Bme680Device::init(i2c, BME680_ADDR).await {
        Ok(sensor) => sensor,
        Err(e) => defmt::panic!("BME680 bring-up failed: {:?}", e),
    };
    let conversion_time = sensor.measurement_duration();
    info!("BME680 ready, conversion time {} ms", conversion_time.as_millis());

    static SAMPLER: StaticCell<Sampler<Bme680Device<I2c0>>> = StaticCell::new();
    let sampler = SAMPLER.init(Sampler::new(sensor, conversion_time));

    let fw = include_bytes!("../cyw43-firmware/43439A0.bin");
    let clm = include_bytes!("../cyw43-firmware/43439A0_clm.bin");

    // Set up the WiFi chip communication via PIO
    let pwr = Output::new(p.PIN_23, Level::Low);
    let cs = Output::new(p.PIN_25, Level::High);
    let mut pio = Pio::new(p.PIO0, Irqs);
    let spi = PioSpi::new(
        &mut pio.common,
        pio.sm0,
        cyw43_pio::DEFAULT_CLOCK_DIVIDER,
        pio.irq0,
        cs,
        p.PIN_24,
        p.PIN_29,
        p.DMA_CH0,
    );

    static STATE: StaticCell<cyw43::State> = StaticCell::new();
    let state = STATE.init(cyw43::State::new());
    let (net_device, mut control, runner) = cyw43::new(state, pwr, spi, fw).await;
    let _ = spawner.spawn(cyw43_task(runner));

    control.init(clm).await;
    control
        .set_power_management(cyw43::PowerManagementMode::PowerSave)
        .await;

    control.gpio_set(0, false).await;

    let wifi_ssid = env!("WIFI_SSID");
    let wifi_password = env!("WIFI_PASSWORD");
    const CLIENT_NAME: &str = "pico-bme680";
    let seed: u64 = RoscRng.next_u64();

    let mut dhcp_config = DhcpConfig::default();
    dhcp_config.hostname = Some(heapless::String::from_str(CLIENT_NAME).unwrap());
    let net_config = NetConfig::dhcpv4(dhcp_config);

    static RESOURCES: StaticCell<embassy_net::StackResources<32>> = StaticCell::new();
    let (stack, runner) = embassy_net::new(
        net_device,
        net_config,
        RESOURCES.init(embassy_net::StackResources::new()),
        seed,
    );
    let _ = spawner.spawn(net_task(runner));
    info!("Joining wifi {}", wifi_ssid);
    while let Err(_) = control
        .join(wifi_ssid, JoinOptions::new(wifi_password.as_bytes()))
        .await
    {
        for _ in 0..10 {
            control.gpio_set(0, true).await;
            Timer::after(Duration::from_millis(100)).await;

            control.gpio_set(0, false).await;
            Timer::after(Duration::from_millis(100)).await;
        }
    }

    stack.wait_link_up().await;
    info!("Link up");
    stack.wait_config_up().await;
    info!("Stack configured");

    // The MAC labels every exported sample; it exists once the radio does.
    let mac = match stack.hardware_address() {
        HardwareAddress::Ethernet(mac) => mac,
        _ => defmt::unreachable!(),
    };
    let device_id = DeviceId::new(mac);
    info!("Device id {}", device_id);

    static APP_STATE: StaticCell<AppState> = StaticCell::new();
    let app_state = APP_STATE.init(AppState { sampler, device_id });

    static WEB_STACK: StaticCell<Stack<'static>> = StaticCell::new();
    let stack = WEB_STACK.init(stack);
    for id in 0..WEB_TASK_POOL_SIZE {
        let _ = spawner.spawn(web_task(id, stack, app_state));
    }
}
