use super::GrpcTransport;
use crate::{Error, Result};
use partstream::{BindError, BindRequest, PartId, Session, StreamHandler, Transport};
use std::{collections::HashMap, sync::Weak};
use tokio::runtime::Handle;
use tonic::{
    codec::CompressionEncoding,
    transport::{Channel, Endpoint},
};

/// Where the partitions of one remote business are served.
///
/// Partition `p` is routed to endpoint `p % endpoints`, so a single endpoint
/// serves every partition.
#[derive(Clone, Debug)]
pub struct Target {
    part_count: u32,
    endpoints: Vec<(String, Channel)>,
}

impl Target {
    pub fn new(part_count: u32) -> Self {
        Self {
            part_count,
            endpoints: Vec::new(),
        }
    }

    #[must_use]
    pub fn endpoint(mut self, addr: impl Into<String>, channel: Channel) -> Self {
        self.endpoints.push((addr.into(), channel));
        self
    }

    /// A target whose partitions are all served from `addr`. Connects on
    /// first use; must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if `addr` is not a valid URI.
    pub fn connect_lazy(part_count: u32, addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        let channel = Endpoint::from_shared(addr.clone())
            .map_err(|e| Error::ChannelError {
                context: format!("invalid endpoint `{addr}`: {e}"),
            })?
            .connect_lazy();
        Ok(Self::new(part_count).endpoint(addr, channel))
    }

    pub const fn part_count(&self) -> u32 {
        self.part_count
    }

    pub(super) fn route(&self, part_id: PartId) -> Option<&(String, Channel)> {
        if self.endpoints.is_empty() {
            return None;
        }
        self.endpoints.get(part_id as usize % self.endpoints.len())
    }

    fn is_degraded(&self) -> bool {
        self.part_count == 0 || self.endpoints.is_empty()
    }
}

/// A [`Session`] that binds gRPC partition streams.
///
/// Stream I/O runs on the runtime behind `handle`; coordinator callbacks are
/// invoked from its worker threads.
#[derive(Clone, Debug)]
pub struct GrpcSession {
    handle: Handle,
    targets: HashMap<String, Target>,
    trace_id: Option<String>,
    compression: Option<CompressionEncoding>,
}

impl GrpcSession {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            targets: HashMap::new(),
            trace_id: None,
            compression: None,
        }
    }

    #[must_use]
    pub fn with_target(mut self, biz_name: impl Into<String>, target: Target) -> Self {
        self.targets.insert(biz_name.into(), target);
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Compresses frames in both directions.
    #[must_use]
    pub fn with_compression(mut self, encoding: CompressionEncoding) -> Self {
        self.compression = Some(encoding);
        self
    }
}

impl Session for GrpcSession {
    fn trace_id(&self) -> Option<String> {
        self.trace_id.clone()
    }

    fn bind(
        &self,
        request: &BindRequest,
        handler: Weak<dyn StreamHandler>,
    ) -> core::result::Result<Box<dyn Transport>, BindError> {
        let biz = &request.biz_name;
        let target = self.targets.get(biz).ok_or_else(|| BindError::NotFound {
            biz: biz.clone(),
        })?;
        if target.is_degraded() {
            return Err(BindError::Degraded { biz: biz.clone() });
        }
        if !request.tags.is_empty() || request.enable_probe {
            tracing::debug!(
                biz = %biz,
                tags = request.tags.len(),
                probe = request.enable_probe,
                "Static targets ignore provider tags and probing"
            );
        }
        tracing::debug!(biz = %biz, part_count = target.part_count, "Bound gRPC stream");
        Ok(Box::new(GrpcTransport::new(
            target,
            self.handle.clone(),
            handler,
            request.timeout,
            self.compression,
        )))
    }
}
