use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::UpdateError;

pub trait Probe {
    /// One attempt. `Err` carries a short reason for the log.
    fn probe(&self) -> Result<(), String>;

    fn describe(&self) -> String;
}

/// GET against the service; any 2xx or 3xx counts as healthy.
pub struct HttpProbe {
    agent: ureq::Agent,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .redirects(0)
            .build();
        Self {
            agent,
            url: url.into(),
        }
    }
}

impl Probe for HttpProbe {
    fn probe(&self) -> Result<(), String> {
        match self.agent.get(&self.url).call() {
            Ok(response) if (200..400).contains(&response.status()) => Ok(()),
            Ok(response) => Err(format!("status {}", response.status())),
            Err(ureq::Error::Status(code, _)) => Err(format!("status {}", code)),
            Err(ureq::Error::Transport(transport)) => Err(transport.to_string()),
        }
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Bounded probing of a freshly started service.
pub struct HealthMonitor {
    probe: Option<Box<dyn Probe>>,
    attempts: u32,
    delay: Duration,
}

impl HealthMonitor {
    pub fn new(probe: Option<Box<dyn Probe>>, attempts: u32, delay: Duration) -> Self {
        Self {
            probe,
            attempts,
            delay,
        }
    }

    /// A monitor with no endpoint: everything is healthy.
    pub fn always_healthy() -> Self {
        Self::new(None, 0, Duration::ZERO)
    }

    pub fn from_config(config: &Config) -> Self {
        let probe = config
            .target
            .health_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| {
                Box::new(HttpProbe::new(
                    url,
                    Duration::from_millis(config.target.health_timeout_ms.max(1)),
                )) as Box<dyn Probe>
            });
        Self::new(
            probe,
            config.target.health_attempts,
            Duration::from_millis(config.target.health_delay_ms),
        )
    }

    pub fn wait_healthy(&self) -> bool {
        let Some(probe) = self.probe.as_ref() else {
            debug!("no health endpoint configured, assuming healthy");
            return true;
        };
        let endpoint = probe.describe();
        for attempt in 1..=self.attempts {
            match probe.probe() {
                Ok(()) => {
                    info!(endpoint = %endpoint, attempt, "service healthy");
                    return true;
                }
                Err(reason) => {
                    debug!(endpoint = %endpoint, attempt, total_attempts = self.attempts, reason = %reason, "health probe failed");
                }
            }
            if attempt < self.attempts && !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
        }
        warn!(endpoint = %endpoint, attempts = self.attempts, "service never became healthy");
        false
    }

    pub fn ensure_healthy(&self) -> Result<(), UpdateError> {
        if self.wait_healthy() {
            Ok(())
        } else {
            Err(UpdateError::Unhealthy {
                attempts: self.attempts,
            })
        }
    }
}
