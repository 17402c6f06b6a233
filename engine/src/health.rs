//! Health endpoint for external liveness probes: HTTP 200 on
//! `{hostname}:{port}/health` while the process is up.

use std::net::IpAddr;

use utilities::{task::spawn_scoped, ScopedJoinHandle};
use warp::Filter;

use crate::settings;

pub fn spawn_health_check(
	health_check_settings: &settings::HealthCheck,
) -> anyhow::Result<ScopedJoinHandle<()>> {
	tracing::info!(
		"Starting health check at http://{}:{}/health",
		health_check_settings.hostname,
		health_check_settings.port,
	);

	let future = warp::serve(
		warp::any()
			.and(warp::path("health"))
			.and(warp::path::end())
			.map(warp::reply),
	)
	.bind((health_check_settings.hostname.parse::<IpAddr>()?, health_check_settings.port));

	Ok(spawn_scoped(future))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn health_check_test() {
		let health_check = settings::HealthCheck {
			hostname: "127.0.0.1".to_string(),
			port: 5556,
		};
		let _server = spawn_health_check(&health_check).unwrap();
		tokio::time::sleep(std::time::Duration::from_millis(100)).await;

		let request_test = |path: &'static str, expected_status: reqwest::StatusCode| {
			let health_check = health_check.clone();
			async move {
				assert_eq!(
					expected_status,
					reqwest::get(&format!(
						"http://{}:{}/{}",
						&health_check.hostname, &health_check.port, path
					))
					.await
					.unwrap()
					.status(),
				);
			}
		};

		request_test("health", reqwest::StatusCode::from_u16(200).unwrap()).await;
		request_test("invalid", reqwest::StatusCode::from_u16(404).unwrap()).await;
	}
}
