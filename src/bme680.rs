use embassy_time::{Duration, Timer};
use embedded_hal::i2c::ErrorType;

use crate::sampler::{Measurement, TriggeredSensor};

// Default I2C address (SDO low)
pub const BME680_ADDR: u8 = 0x76;

// BME680 Register Addresses
const REG_RES_HEAT_VAL: u8 = 0x00;
const REG_RES_HEAT_RANGE: u8 = 0x02;
const REG_RANGE_SW_ERR: u8 = 0x04;
const REG_MEAS_STATUS_0: u8 = 0x1D;
const REG_RES_HEAT_0: u8 = 0x5A;
const REG_GAS_WAIT_0: u8 = 0x64;
const REG_CTRL_GAS_1: u8 = 0x71;
const REG_CTRL_HUM: u8 = 0x72;
const REG_CTRL_MEAS: u8 = 0x74;
const REG_CONFIG: u8 = 0x75;
const REG_COEFF_1: u8 = 0x89;
const REG_SOFT_RESET: u8 = 0xE0;
const REG_COEFF_2: u8 = 0xE1;
const REG_CHIP_ID: u8 = 0xD0;

const CHIP_ID: u8 = 0x61;
const SOFT_RESET_CMD: u8 = 0xB6;
const RESET_DELAY: Duration = Duration::from_millis(10);

// meas_status_0 bits
const NEW_DATA_MSK: u8 = 0x80;
// gas_r_lsb bits
const GAS_VALID_MSK: u8 = 0x20;
const GAS_RANGE_MSK: u8 = 0x0F;

// ctrl_meas mode bits
const MODE_FORCED: u8 = 0x01;
// ctrl_gas_1: run_gas, heater profile 0
const RUN_GAS: u8 = 0x10;

const COEFF_1_LEN: usize = 25;
const COEFF_2_LEN: usize = 16;
const COEFF_LEN: usize = COEFF_1_LEN + COEFF_2_LEN;

// Measurement profile, matching the exporter this one replaces: 4x/2x/2x
// oversampling, IIR filter coefficient 7, heater at 200 degC for 100 ms.
const OSR_TEMPERATURE: Oversampling = Oversampling::X4;
const OSR_PRESSURE: Oversampling = Oversampling::X2;
const OSR_HUMIDITY: Oversampling = Oversampling::X2;
const FILTER_COEFF_7: u8 = 0b011;
const HEATER_TARGET_C: u16 = 200;
const HEATER_DURATION_MS: u16 = 100;
const AMBIENT_TEMPERATURE_C: i8 = 10;

#[derive(Clone, Copy)]
#[repr(u8)]
#[allow(dead_code)]
enum Oversampling {
    Skip = 0,
    X1 = 1,
    X2 = 2,
    X4 = 3,
    X8 = 4,
    X16 = 5,
}

impl Oversampling {
    const fn cycles(self) -> u32 {
        match self {
            Oversampling::Skip => 0,
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 4,
            Oversampling::X8 => 8,
            Oversampling::X16 => 16,
        }
    }
}

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bme680Error<E> {
    I2c(E),
    BadChipId(u8),
    NotReady,
}

impl<E> From<E> for Bme680Error<E> {
    fn from(error: E) -> Self {
        Bme680Error::I2c(error)
    }
}

/// Factory calibration coefficients, read once at init and applied to every
/// raw ADC value afterwards. Formulas follow the datasheet's floating-point
/// compensation, section 3.
#[derive(Default)]
struct Calibration {
    par_t1: u16,
    par_t2: i16,
    par_t3: i8,
    par_p1: u16,
    par_p2: i16,
    par_p3: i8,
    par_p4: i16,
    par_p5: i16,
    par_p6: i8,
    par_p7: i8,
    par_p8: i16,
    par_p9: i16,
    par_p10: u8,
    par_h1: u16,
    par_h2: u16,
    par_h3: i8,
    par_h4: i8,
    par_h5: i8,
    par_h6: u8,
    par_h7: i8,
    par_gh1: i8,
    par_gh2: i16,
    par_gh3: i8,
    res_heat_range: u8,
    res_heat_val: i8,
    range_sw_err: i8,
}

const GAS_RANGE_C1: [f64; 16] = [
    1.0, 1.0, 1.0, 1.0, 1.0, 0.99, 1.0, 0.992, 1.0, 1.0, 0.998, 0.995, 1.0, 0.99, 1.0, 1.0,
];
const GAS_RANGE_C2: [f64; 16] = [
    8_000_000.0,
    4_000_000.0,
    2_000_000.0,
    1_000_000.0,
    499_500.4995,
    248_262.1648,
    125_000.0,
    63_004.03226,
    31_281.28128,
    15_625.0,
    7_812.5,
    3_906.25,
    1_953.125,
    976.5625,
    488.28125,
    244.140625,
];

impl Calibration {
    fn parse(coeff: &[u8; COEFF_LEN], res_heat_range: u8, res_heat_val: i8, range_sw_err: i8) -> Self {
        let u16le = |l: usize, m: usize| ((coeff[m] as u16) << 8) | coeff[l] as u16;
        Self {
            par_t1: u16le(33, 34),
            par_t2: u16le(1, 2) as i16,
            par_t3: coeff[3] as i8,
            par_p1: u16le(5, 6),
            par_p2: u16le(7, 8) as i16,
            par_p3: coeff[9] as i8,
            par_p4: u16le(11, 12) as i16,
            par_p5: u16le(13, 14) as i16,
            par_p7: coeff[15] as i8,
            par_p6: coeff[16] as i8,
            par_p8: u16le(19, 20) as i16,
            par_p9: u16le(21, 22) as i16,
            par_p10: coeff[23],
            // H1 and H2 share the nibble at offset 26
            par_h2: ((coeff[25] as u16) << 4) | ((coeff[26] as u16) >> 4),
            par_h1: ((coeff[27] as u16) << 4) | ((coeff[26] as u16) & 0x0F),
            par_h3: coeff[28] as i8,
            par_h4: coeff[29] as i8,
            par_h5: coeff[30] as i8,
            par_h6: coeff[31],
            par_h7: coeff[32] as i8,
            par_gh2: u16le(35, 36) as i16,
            par_gh1: coeff[37] as i8,
            par_gh3: coeff[38] as i8,
            res_heat_range,
            res_heat_val,
            range_sw_err,
        }
    }

    /// Returns `(t_fine, degrees Celsius)`; `t_fine` feeds the pressure
    /// compensation.
    fn compensate_temperature(&self, adc: u32) -> (f64, f64) {
        let adc = adc as f64;
        let var1 = (adc / 16384.0 - self.par_t1 as f64 / 1024.0) * self.par_t2 as f64;
        let var2 = adc / 131072.0 - self.par_t1 as f64 / 8192.0;
        let var2 = var2 * var2 * self.par_t3 as f64 * 16.0;
        let t_fine = var1 + var2;
        (t_fine, t_fine / 5120.0)
    }

    /// Pascals.
    fn compensate_pressure(&self, adc: u32, t_fine: f64) -> f64 {
        let var1 = t_fine / 2.0 - 64000.0;
        let var2 = var1 * var1 * (self.par_p6 as f64 / 131072.0);
        let var2 = var2 + var1 * self.par_p5 as f64 * 2.0;
        let var2 = var2 / 4.0 + self.par_p4 as f64 * 65536.0;
        let var1 =
            (self.par_p3 as f64 * var1 * var1 / 16384.0 + self.par_p2 as f64 * var1) / 524288.0;
        let var1 = (1.0 + var1 / 32768.0) * self.par_p1 as f64;
        if var1 == 0.0 {
            return 0.0;
        }
        let press = (1048576.0 - adc as f64 - var2 / 4096.0) * 6250.0 / var1;
        let var1 = self.par_p9 as f64 * press * press / 2147483648.0;
        let var2 = press * (self.par_p8 as f64 / 32768.0);
        let var3 =
            (press / 256.0) * (press / 256.0) * (press / 256.0) * (self.par_p10 as f64 / 131072.0);
        press + (var1 + var2 + var3 + self.par_p7 as f64 * 128.0) / 16.0
    }

    /// Percent relative humidity, clamped to the physical 0..=100 range.
    fn compensate_humidity(&self, adc: u16, temp_comp: f64) -> f64 {
        let var1 =
            adc as f64 - (self.par_h1 as f64 * 16.0 + self.par_h3 as f64 / 2.0 * temp_comp);
        let var2 = var1
            * (self.par_h2 as f64 / 262144.0
                * (1.0
                    + self.par_h4 as f64 / 16384.0 * temp_comp
                    + self.par_h5 as f64 / 1048576.0 * temp_comp * temp_comp));
        let var3 = self.par_h6 as f64 / 16384.0;
        let var4 = self.par_h7 as f64 / 2097152.0;
        let hum = var2 + (var3 + var4 * temp_comp) * var2 * var2;
        hum.clamp(0.0, 100.0)
    }

    /// Ohms.
    fn compensate_gas(&self, adc: u16, range: u8) -> f64 {
        let range = (range & GAS_RANGE_MSK) as usize;
        let var1 = (1340.0 + 5.0 * self.range_sw_err as f64) * GAS_RANGE_C1[range];
        var1 * GAS_RANGE_C2[range] / (adc as f64 - 512.0 + var1)
    }

    /// res_heat_x register value for a heater set point.
    fn heater_resistance(&self, target_c: u16, ambient_c: i8) -> u8 {
        let target = target_c.min(400) as f64;
        let var1 = self.par_gh1 as f64 / 16.0 + 49.0;
        let var2 = self.par_gh2 as f64 / 32768.0 * 0.0005 + 0.00235;
        let var3 = self.par_gh3 as f64 / 1024.0;
        let var4 = var1 * (1.0 + var2 * target);
        let var5 = var4 + var3 * ambient_c as f64;
        let res_heat = 3.4
            * (var5 * (4.0 / (4.0 + self.res_heat_range as f64))
                * (1.0 / (1.0 + self.res_heat_val as f64 * 0.002))
                - 25.0);
        res_heat.clamp(0.0, 255.0) as u8
    }
}

/// gas_wait_x encoding: 6-bit mantissa with a x1/x4/x16/x64 multiplier.
fn gas_wait(duration_ms: u16) -> u8 {
    let mut dur = duration_ms.min(0x3F * 64);
    let mut factor: u8 = 0;
    while dur > 0x3F {
        dur /= 4;
        factor += 1;
    }
    (factor << 6) | dur as u8
}

pub struct Bme680Device<I> {
    addr: u8,
    i2c: I,
    calib: Calibration,
}

impl<I: embedded_hal_async::i2c::I2c> Bme680Device<I> {
    /// Probes and configures the sensor. Everything the device needs for its
    /// fixed measurement profile is programmed here; afterwards each cycle is
    /// just a forced-mode trigger and a data-register read.
    pub async fn init(i2c: I, addr: u8) -> Result<Self, Bme680Error<<I as ErrorType>::Error>> {
        let mut dev = Self {
            addr,
            i2c,
            calib: Calibration::default(),
        };

        let id = dev.read_register(REG_CHIP_ID).await?;
        if id != CHIP_ID {
            return Err(Bme680Error::BadChipId(id));
        }

        dev.write_register(REG_SOFT_RESET, SOFT_RESET_CMD).await?;
        Timer::after(RESET_DELAY).await;

        let mut coeff = [0u8; COEFF_LEN];
        dev.i2c
            .write_read(dev.addr, &[REG_COEFF_1], &mut coeff[..COEFF_1_LEN])
            .await?;
        dev.i2c
            .write_read(dev.addr, &[REG_COEFF_2], &mut coeff[COEFF_1_LEN..])
            .await?;
        let res_heat_range = (dev.read_register(REG_RES_HEAT_RANGE).await? & 0x30) >> 4;
        let res_heat_val = dev.read_register(REG_RES_HEAT_VAL).await? as i8;
        let range_sw_err = ((dev.read_register(REG_RANGE_SW_ERR).await? & 0xF0) as i8) >> 4;
        dev.calib = Calibration::parse(&coeff, res_heat_range, res_heat_val, range_sw_err);

        dev.write_register(REG_CTRL_HUM, OSR_HUMIDITY as u8).await?;
        dev.write_register(REG_CONFIG, FILTER_COEFF_7 << 2).await?;

        // Heater profile 0
        let res_heat = dev
            .calib
            .heater_resistance(HEATER_TARGET_C, AMBIENT_TEMPERATURE_C);
        dev.write_register(REG_RES_HEAT_0, res_heat).await?;
        dev.write_register(REG_GAS_WAIT_0, gas_wait(HEATER_DURATION_MS))
            .await?;
        dev.write_register(REG_CTRL_GAS_1, RUN_GAS).await?;

        // Oversampling in place, mode stays sleep until the first trigger
        dev.write_register(
            REG_CTRL_MEAS,
            (OSR_TEMPERATURE as u8) << 5 | (OSR_PRESSURE as u8) << 2,
        )
        .await?;

        Ok(dev)
    }

    /// Worst-case duration of one TPHG cycle under the configured profile.
    /// Constant as long as the configuration is, so callers query it once.
    pub fn measurement_duration(&self) -> Duration {
        let cycles =
            OSR_TEMPERATURE.cycles() + OSR_PRESSURE.cycles() + OSR_HUMIDITY.cycles();
        let mut us = cycles * 1963;
        us += 477 * 4; // TPH switching
        us += 477 * 5; // gas measurement
        us += 500;
        let ms = us / 1000 + 1; // wake-up
        Duration::from_millis((ms + HEATER_DURATION_MS as u32) as u64)
    }

    async fn read_register(&mut self, register: u8) -> Result<u8, <I as ErrorType>::Error> {
        let mut buffer = [0u8; 1];
        self.i2c
            .write_read(self.addr, &[register], &mut buffer)
            .await?;
        Ok(buffer[0])
    }

    async fn write_register(
        &mut self,
        register: u8,
        value: u8,
    ) -> Result<(), <I as ErrorType>::Error> {
        self.i2c.write(self.addr, &[register, value]).await
    }
}

impl<I: embedded_hal_async::i2c::I2c> TriggeredSensor for Bme680Device<I> {
    type Error = Bme680Error<<I as ErrorType>::Error>;

    async fn trigger_measurement(&mut self) -> Result<(), Self::Error> {
        let ctrl = (OSR_TEMPERATURE as u8) << 5 | (OSR_PRESSURE as u8) << 2 | MODE_FORCED;
        self.write_register(REG_CTRL_MEAS, ctrl).await?;
        Ok(())
    }

    async fn read_measurement(&mut self) -> Result<Measurement, Self::Error> {
        // meas_status_0 through gas_r_lsb in one burst
        let mut buf = [0u8; 15];
        self.i2c
            .write_read(self.addr, &[REG_MEAS_STATUS_0], &mut buf)
            .await?;

        if buf[0] & NEW_DATA_MSK == 0 {
            return Err(Bme680Error::NotReady);
        }

        let press_adc = ((buf[2] as u32) << 12) | ((buf[3] as u32) << 4) | ((buf[4] as u32) >> 4);
        let temp_adc = ((buf[5] as u32) << 12) | ((buf[6] as u32) << 4) | ((buf[7] as u32) >> 4);
        let hum_adc = ((buf[8] as u16) << 8) | buf[9] as u16;
        let gas_adc = ((buf[13] as u16) << 2) | ((buf[14] as u16) >> 6);
        let gas_valid = buf[14] & GAS_VALID_MSK != 0;

        let (t_fine, temperature) = self.calib.compensate_temperature(temp_adc);
        let pressure = self.calib.compensate_pressure(press_adc, t_fine) / 100.0; // hPa
        let humidity = self.calib.compensate_humidity(hum_adc, temperature);
        let gas_resistance = if gas_valid {
            self.calib.compensate_gas(gas_adc, buf[14])
        } else {
            0.0
        };

        Ok(Measurement {
            temperature,
            humidity,
            pressure,
            gas_resistance,
        })
    }
}
