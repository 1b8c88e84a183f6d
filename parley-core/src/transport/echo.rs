//! Loopback transport: every outbound frame comes straight back as an inbound
//! chunk at the output rate. Exercises the full duplex path on real devices
//! without a remote service.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tracing::{debug, info};

use crate::{
    audio::resample,
    buffering::frame::AudioFrame,
    codec,
    error::{ParleyError, Result},
    transport::{
        SessionConfig, SessionTransport, TransportEventSender, TransportHandle, NORMAL_CLOSE_CODE,
    },
};

#[derive(Debug, Clone)]
pub struct EchoTransport {
    /// Rate (Hz) of the chunks echoed back.
    pub output_sample_rate: u32,
}

impl EchoTransport {
    pub fn new(output_sample_rate: u32) -> Self {
        Self { output_sample_rate }
    }
}

impl Default for EchoTransport {
    fn default() -> Self {
        Self::new(24_000)
    }
}

impl SessionTransport for EchoTransport {
    fn open(
        &self,
        config: &SessionConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn TransportHandle>> {
        info!(
            source_language = config.source_language.as_deref().unwrap_or("-"),
            target_language = config.target_language.as_deref().unwrap_or("-"),
            "echo session opened"
        );
        events.opened();
        Ok(Arc::new(EchoHandle {
            events,
            output_sample_rate: self.output_sample_rate,
            open: AtomicBool::new(true),
        }))
    }
}

struct EchoHandle {
    events: TransportEventSender,
    output_sample_rate: u32,
    open: AtomicBool,
}

impl TransportHandle for EchoHandle {
    fn send(&self, frame: &AudioFrame) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ParleyError::SendFailed("echo session is closed".into()));
        }
        let samples = codec::decode(frame.as_bytes())?;
        let echoed =
            resample::resample_block(&samples, frame.sample_rate, self.output_sample_rate)?;
        debug!(seq = frame.seq, samples = echoed.len(), "echoing frame");
        if !self.events.chunk(codec::encode(&echoed)) {
            return Err(ParleyError::SendFailed("session receiver is gone".into()));
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.events.closed(NORMAL_CLOSE_CODE, "closed by client");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEvent;

    #[test]
    fn opens_immediately_and_echoes_at_output_rate() {
        let (events, mut rx) = TransportEventSender::channel();
        let handle = EchoTransport::new(24_000)
            .open(&SessionConfig::default(), events)
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Opened);

        handle
            .send(&AudioFrame::encode(0, &vec![0.25; 1_600], 16_000))
            .unwrap();
        match rx.try_recv().unwrap() {
            TransportEvent::ChunkReceived(pcm) => {
                assert_eq!(pcm.len(), 2_400 * codec::BYTES_PER_SAMPLE);
            }
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn close_is_idempotent_and_rejects_later_sends() {
        let (events, mut rx) = TransportEventSender::channel();
        let handle = EchoTransport::default()
            .open(&SessionConfig::default(), events)
            .unwrap();
        let _ = rx.try_recv();

        handle.close().unwrap();
        handle.close().unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Closed {
                code: NORMAL_CLOSE_CODE,
                reason: "closed by client".into()
            }
        );
        assert!(rx.try_recv().is_err());
        assert!(matches!(
            handle.send(&AudioFrame::encode(1, &[0.0; 4], 16_000)),
            Err(ParleyError::SendFailed(_))
        ));
    }
}
