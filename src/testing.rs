//! Scripted collaborator fakes shared by the module tests

use crate::barcode::{ProductDatabase, ProductRecord};
use crate::error::{UpstreamError, UpstreamKind};
use crate::vision::{prompts, VisionApi, VisionRequest, VisionResponse};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Vision fake that replays a fixed reply sequence in call order.
/// Suitable for single-stage tests where call order is deterministic.
pub(crate) struct ScriptedVision {
    replies: Mutex<VecDeque<Result<String, UpstreamError>>>,
    calls: AtomicU32,
}

impl ScriptedVision {
    pub fn replies(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionApi for ScriptedVision {
    async fn complete(&self, _request: &VisionRequest) -> Result<VisionResponse, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .replies
            .lock()
            .expect("scripted replies lock")
            .pop_front();
        match next {
            Some(Ok(content)) => Ok(VisionResponse { content }),
            Some(Err(err)) => Err(err),
            None => Err(UpstreamError::server("no scripted reply left")),
        }
    }
}

/// Vision fake that routes replies by stage, for pipeline tests where the
/// label call runs concurrently with identification.
#[derive(Default)]
pub(crate) struct RoutedVision {
    identify: Mutex<VecDeque<String>>,
    portion: Mutex<VecDeque<String>>,
    label: Mutex<VecDeque<String>>,
    calls: AtomicU32,
}

impl RoutedVision {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_identify(&self, reply: &str) {
        self.identify.lock().unwrap().push_back(reply.to_string());
    }

    pub fn push_portion(&self, reply: &str) {
        self.portion.lock().unwrap().push_back(reply.to_string());
    }

    pub fn push_label(&self, reply: &str) {
        self.label.lock().unwrap().push_back(reply.to_string());
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionApi for RoutedVision {
    async fn complete(&self, request: &VisionRequest) -> Result<VisionResponse, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let queue = if request.system == prompts::IDENTIFY_SYSTEM {
            &self.identify
        } else if request.system == prompts::PORTION_SYSTEM {
            &self.portion
        } else {
            &self.label
        };
        queue
            .lock()
            .expect("routed replies lock")
            .pop_front()
            .map(|content| VisionResponse { content })
            .ok_or_else(|| UpstreamError::server("no scripted reply left for stage"))
    }
}

/// Vision fake simulating a full outage: every call fails the same way
pub(crate) struct FailingVision {
    pub kind: UpstreamKind,
    calls: AtomicU32,
}

impl FailingVision {
    pub fn new(kind: UpstreamKind) -> Self {
        Self {
            kind,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionApi for FailingVision {
    async fn complete(&self, _request: &VisionRequest) -> Result<VisionResponse, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(UpstreamError::new(self.kind, "simulated outage"))
    }
}

/// Vision fake that answers after a fixed delay, for deadline tests
pub(crate) struct SlowVision {
    pub delay: Duration,
    pub reply: String,
}

#[async_trait]
impl VisionApi for SlowVision {
    async fn complete(&self, _request: &VisionRequest) -> Result<VisionResponse, UpstreamError> {
        tokio::time::sleep(self.delay).await;
        Ok(VisionResponse {
            content: self.reply.clone(),
        })
    }
}

/// Product database fake backed by a fixed map; unknown barcodes are a
/// definitive not-found.
#[derive(Default)]
pub(crate) struct StaticProducts {
    products: HashMap<String, ProductRecord>,
    calls: AtomicU32,
}

impl StaticProducts {
    pub fn with(barcode: &str, product: ProductRecord) -> Self {
        let mut products = HashMap::new();
        products.insert(barcode.to_string(), product);
        Self {
            products,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProductDatabase for StaticProducts {
    async fn lookup(&self, barcode: &str) -> Result<Option<ProductRecord>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.products.get(barcode).cloned())
    }
}

/// Product database fake where every lookup fails transiently
pub(crate) struct FailingProducts;

#[async_trait]
impl ProductDatabase for FailingProducts {
    async fn lookup(&self, _barcode: &str) -> Result<Option<ProductRecord>, UpstreamError> {
        Err(UpstreamError::server("simulated product database outage"))
    }
}
