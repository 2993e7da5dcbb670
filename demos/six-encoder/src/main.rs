//! Six-encoder polling demo
//!
//! Programs six SPI quadrature-encoder chips on the Raspberry Pi Pico 2,
//! then polls their angles and logs them via defmt together with the bus
//! throughput.
//!
//! # Wiring
//!
//! | Signal    | Pico 2 Pin | Notes                          |
//! |-----------|------------|--------------------------------|
//! | SPI0 SCK  | GP2        |                                |
//! | SPI0 MOSI | GP3        |                                |
//! | SPI0 MISO | GP4        |                                |
//! | DEC A0    | GP16       | Decoder address, idle high     |
//! | DEC A1    | GP20       | Decoder address, idle high     |
//! | DEC A2    | GP21       | Decoder address, idle high     |

#![no_std]
#![no_main]

use defmt::*;
use embassy_executor::Spawner;
use embassy_rp as hal;
use embassy_rp::block::ImageDef;
use embassy_rp::gpio::{Level, Output};
use embassy_rp::spi::{self, Spi};
use embassy_time::{Delay, Duration};
use {defmt_rtt as _, panic_probe as _};

use encoder_mux::registers::DEFAULT_SPEED_HZ;
use encoder_mux::{
    AddressTable, CancelToken, ChannelSelector, EncoderBus, HalController, Link, LinkConfig,
    ModeFlags, PollConfig, PollEvent, PollingLoop,
};

/// Tell the Boot ROM about our application.
#[link_section = ".start_block"]
#[used]
pub static IMAGE_DEF: ImageDef = hal::block::ImageDef::secure_exe();

static CANCEL: CancelToken = CancelToken::new();

#[embassy_executor::main]
async fn main(_spawner: Spawner) {
    let p = embassy_rp::init(Default::default());

    // --- SPI0 (GP2 = SCK, GP3 = MOSI, GP4 = MISO), mode 0 ---
    let mut spi_config = spi::Config::default();
    spi_config.frequency = DEFAULT_SPEED_HZ;
    let spi = Spi::new(
        p.SPI0, p.PIN_2, p.PIN_3, p.PIN_4, p.DMA_CH0, p.DMA_CH1, spi_config,
    );

    // --- Decoder address lines, parked on the idle pattern ---
    let lines = [
        Output::new(p.PIN_16, Level::High),
        Output::new(p.PIN_20, Level::High),
        Output::new(p.PIN_21, Level::High),
    ];

    let controller = HalController::new(spi, Delay, ModeFlags::empty(), DEFAULT_SPEED_HZ);
    let (link, negotiation) = match Link::open(controller, LinkConfig::default()).await {
        Ok(opened) => opened,
        Err(e) => halt(e),
    };
    if !negotiation.is_exact() {
        warn!("running with {}", negotiation.effective);
    }

    let selector = match ChannelSelector::new(lines, AddressTable::default()) {
        Ok(selector) => selector,
        Err(e) => halt(e),
    };

    let config = PollConfig {
        cycles: Some(10_000),
        report_interval: Duration::from_secs(5),
        ..PollConfig::default()
    };
    let mut poller = match PollingLoop::new(EncoderBus::new(link, selector), config) {
        Ok(poller) => poller.with_cancel(&CANCEL),
        Err(e) => halt(e),
    };

    info!("Polling {} encoders", config.channels);

    let result = poller
        .run(|event| match event {
            PollEvent::Cycle(result) if result.cycle % 100 == 0 => {
                info!("cycle {}: {}", result.cycle, result.angles.as_slice());
            }
            PollEvent::Cycle(_) => {}
            PollEvent::Rate(report) => info!("{}", report),
        })
        .await;

    match result {
        Ok(summary) => info!("done: {}", summary),
        Err(e) => halt(e),
    }
}

fn halt(e: impl Format) -> ! {
    error!("fatal: {}", e);
    loop {
        cortex_m::asm::wfi();
    }
}
