use jobrunner::{async_trait, JobHandler};
use serde::{Deserialize, Serialize};

jobrunner::job_handlers! {
    struct DemoHandlers {
        sample_message: SampleMessage,
        slow_message: SlowMessage,
    }
}

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct SampleMessage {
    pub txt: String,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct SlowMessage {
    pub txt: String,
    pub delay_ms: u64,
}

pub struct SampleHandler;

#[async_trait]
impl JobHandler for SampleHandler {
    type Payload = SampleMessage;

    async fn process(&self, payload: &SampleMessage) -> anyhow::Result<String> {
        tracing::info!("On handle sample_message: {:?}", payload);
        Ok(format!("echo {}", payload.txt))
    }
}

pub struct SlowHandler;

#[async_trait]
impl JobHandler for SlowHandler {
    type Payload = SlowMessage;

    fn pre_check(&self, payload: &SlowMessage) -> anyhow::Result<()> {
        if payload.delay_ms > 10_000 {
            anyhow::bail!("refusing to sleep {}ms", payload.delay_ms);
        }
        Ok(())
    }

    async fn process(&self, payload: &SlowMessage) -> anyhow::Result<String> {
        tokio::time::sleep(std::time::Duration::from_millis(payload.delay_ms)).await;
        Ok(format!("{} after {}ms", payload.txt, payload.delay_ms))
    }
}

pub fn handlers() -> jobrunner::HandlerRegistry {
    DemoHandlers::builder()
        .with_sample_message_handler(SampleHandler)
        .with_slow_message_handler(SlowHandler)
        .build()
}
