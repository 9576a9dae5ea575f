use defmt::{error, info};
use embassy_net::Stack;
use embassy_time::Duration;
use picoserve::response::chunked::{ChunkWriter, ChunkedResponse, Chunks, ChunksWritten};
use picoserve::response::{IntoResponse, Json, StatusCode};
use picoserve::routing::get;

use defmt_rtt as _;

use crate::bme680::Bme680Device;
use crate::exporter::{exposition, DeviceId, SystemInfo, EXPOSITION_CAPACITY};
use crate::sampler::Sampler;
use crate::I2c0;

pub const WEB_TASK_POOL_SIZE: usize = 8;

#[derive(Clone, Copy)]
pub struct AppState {
    pub sampler: &'static Sampler<Bme680Device<I2c0>>,
    pub device_id: DeviceId,
}

struct ExpositionResponse {
    body: heapless::String<EXPOSITION_CAPACITY>,
}

impl Chunks for ExpositionResponse {
    fn content_type(&self) -> &'static str {
        "text/plain; version=0.0.4; charset=utf-8"
    }

    async fn write_chunks<W: picoserve::io::Write>(
        self,
        mut chunk_writer: ChunkWriter<W>,
    ) -> Result<ChunksWritten, W::Error> {
        write!(chunk_writer, "{}", self.body).await?;
        chunk_writer.finalize().await
    }
}

async fn system_info() -> impl IntoResponse {
    info!("GET /info");
    Json(SystemInfo::current())
}

async fn metrics(
    picoserve::extract::State(app): picoserve::extract::State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, &'static str)> {
    info!("GET /metrics");
    let reading = match app.sampler.acquire().await {
        Ok(reading) => reading,
        Err(e) => {
            error!("sensor cycle failed: {:?}", e);
            // A stale reading beats an error page; only a unit that has never
            // completed a cycle reports unavailable.
            match app.sampler.latest().await {
                Some(reading) => reading,
                None => {
                    return Err((
                        StatusCode::SERVICE_UNAVAILABLE,
                        "sensor reading not yet available\n",
                    ))
                }
            }
        }
    };

    match exposition(&app.device_id, &reading) {
        Ok(body) => Ok(ChunkedResponse::new(ExpositionResponse { body })),
        Err(_) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics rendering failed\n",
        )),
    }
}

#[embassy_executor::task(pool_size = WEB_TASK_POOL_SIZE)]
pub async fn web_task(id: usize, stack: &'static Stack<'static>, app_state: &'static AppState) {
    let app = picoserve::Router::new()
        .route("/info", get(system_info))
        .route("/metrics", get(metrics));

    loop {
        let config = picoserve::Config::new(picoserve::Timeouts {
            start_read_request: Some(Duration::from_secs(5)),
            persistent_start_read_request: Some(Duration::from_secs(1)),
            read_request: Some(Duration::from_secs(1)),
            write: Some(Duration::from_secs(1)),
        });

        let mut rx_buffer = [0; 1024];
        let mut tx_buffer = [0; 1024];
        let mut http_buffer = [0; 2048];
        let _ = picoserve::listen_and_serve_with_state(
            id,
            &app,
            &config,
            *stack,
            80,
            &mut rx_buffer,
            &mut tx_buffer,
            &mut http_buffer,
            &app_state,
        )
        .await;
    }
}
