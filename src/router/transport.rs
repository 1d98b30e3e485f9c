//! Common behavior of all transport kinds.
//!
//! Every transport owns the producers and consumers created on it, hands
//! out `mid` values for consumer parameter synthesis and manages the SCTP
//! stream-id slots of its association.

use crate::consumer::{Consumer, ConsumerId, ConsumerOptions};
use crate::data_consumer::{DataConsumer, DataConsumerId, DataConsumerOptions, DataConsumerType};
use crate::data_producer::{DataProducer, DataProducerId, DataProducerOptions, DataProducerType};
use crate::data_structures::{
    AppData, ConsumerInternal, DataConsumerInternal, DataProducerInternal, EventDirection,
    ProducerInternal, TransportInternal,
};
use crate::events::EventKind;
use crate::messages::{
    TransportConsumeData, TransportConsumeDataData, TransportConsumeDataRequest,
    TransportConsumeRequest, TransportDumpRequest, TransportEnableTraceEventData,
    TransportEnableTraceEventRequest, TransportGetStatsRequest, TransportProduceData,
    TransportProduceDataData, TransportProduceDataRequest, TransportProduceRequest,
    TransportSetMaxIncomingBitrateData, TransportSetMaxIncomingBitrateRequest,
};
use crate::ortc;
use crate::producer::{Producer, ProducerId, ProducerOptions};
use crate::registry::Resource;
use crate::router::{Router, RouterId};
use crate::sctp_parameters::SctpStreamParameters;
use crate::worker::{Channel, PayloadChannel, RequestError};
use async_executor::Executor;
use async_trait::async_trait;
use event_listener_primitives::HandlerId;
use log::*;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

uuid_based_wrapper_type!(
    /// Transport identifier.
    TransportId
);

/// Consumer `mid` values wrap when they reach this bound.
const MID_MAX: usize = 100_000_000;

/// SCTP stream slots are bounded by what the association can express.
pub(crate) const SCTP_STREAMS_MAX: u16 = 4096;

/// Types of transport trace events.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportTraceEventType {
    Probation,
    BWE,
}

/// 'trace' event data.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportTraceEventData {
    Probation {
        timestamp: u64,
        direction: EventDirection,
        info: Value,
    },
    BWE {
        timestamp: u64,
        direction: EventDirection,
        info: Value,
    },
}

/// Error of `produce()`.
#[derive(Debug, Error)]
pub enum ProduceError {
    #[error("producer RTP parameters do not match router capabilities: {0}")]
    FailedRtpParametersMapping(ortc::RtpParametersMappingError),
    #[error("request to worker failed: {0}")]
    Request(RequestError),
}

/// Error of `consume()`.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("producer {0} not found")]
    ProducerNotFound(ProducerId),
    #[error("consumer RTP capabilities do not match the producer: {0}")]
    BadConsumerRtpParameters(ortc::ConsumerRtpParametersError),
    #[error("request to worker failed: {0}")]
    Request(RequestError),
}

/// Error of `produce_data()`.
#[derive(Debug, Error)]
pub enum ProduceDataError {
    #[error("SCTP stream parameters required for this transport kind")]
    SctpStreamParametersRequired,
    #[error("SCTP stream parameters must not be given on a direct transport")]
    SctpStreamParametersNotAllowed,
    #[error("request to worker failed: {0}")]
    Request(RequestError),
}

/// Error of `consume_data()`.
#[derive(Debug, Error)]
pub enum ConsumeDataError {
    #[error("data producer {0} not found")]
    DataProducerNotFound(DataProducerId),
    #[error("no free SCTP stream id on this transport")]
    NoSctpStreamId,
    #[error("request to worker failed: {0}")]
    Request(RequestError),
}

/// Round-robin SCTP stream-id allocator over a fixed number of slots.
///
/// Slots are sized from the worker-reported MIS and live as long as the
/// transport; ids are not returned individually.
pub(crate) struct SctpStreamSlots {
    slots: Vec<bool>,
    next: usize,
}

impl SctpStreamSlots {
    pub(crate) fn new(max_slots: u16) -> Self {
        Self {
            slots: vec![false; usize::from(max_slots)],
            next: 0,
        }
    }

    /// First free id starting at the cursor; `None` when every slot is in
    /// use.
    pub(crate) fn allocate(&mut self) -> Option<u16> {
        let len = self.slots.len();
        if len == 0 {
            return None;
        }
        for offset in 0..len {
            let id = (self.next + offset) % len;
            if !self.slots[id] {
                self.slots[id] = true;
                self.next = id + 1;
                return Some(id as u16);
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        self.slots.iter().filter(|used| **used).count()
    }
}

/// Identity of a transport child; used when a closing child removes
/// itself from the parent's list.
#[doc(hidden)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportChildId {
    Producer(ProducerId),
    Consumer(ConsumerId),
    DataProducer(DataProducerId),
    DataConsumer(DataConsumerId),
}

/// Weak handle to any child of a transport, kept for ordered teardown.
pub(crate) enum WeakTransportChild {
    Producer(crate::producer::WeakProducer),
    Consumer(crate::consumer::WeakConsumer),
    DataProducer(crate::data_producer::WeakDataProducer),
    DataConsumer(crate::data_consumer::WeakDataConsumer),
}

/// State shared by every transport kind.
pub(crate) struct TransportState {
    pub(crate) next_mid_for_consumers: AtomicUsize,
    pub(crate) sctp_stream_slots: Mutex<SctpStreamSlots>,
    pub(crate) children: Mutex<Vec<(TransportChildId, WeakTransportChild)>>,
}

impl TransportState {
    pub(crate) fn new(sctp_max_slots: u16) -> Self {
        Self {
            next_mid_for_consumers: AtomicUsize::new(0),
            sctp_stream_slots: Mutex::new(SctpStreamSlots::new(sctp_max_slots)),
            children: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn remove_child(&self, child_id: TransportChildId) {
        self.children.lock().retain(|(id, _)| *id != child_id);
    }

    /// Closes all children in reverse insertion order; used on transport
    /// teardown.
    pub(crate) fn close_children(&self) {
        let children = {
            let mut children = self.children.lock();
            std::mem::take(&mut *children)
        };
        for (_, child) in children.iter().rev() {
            match child {
                WeakTransportChild::Producer(weak) => {
                    if let Some(producer) = weak.upgrade() {
                        producer.close_from_transport();
                    }
                }
                WeakTransportChild::Consumer(weak) => {
                    if let Some(consumer) = weak.upgrade() {
                        consumer.close_from_transport();
                    }
                }
                WeakTransportChild::DataProducer(weak) => {
                    if let Some(data_producer) = weak.upgrade() {
                        data_producer.close_from_transport();
                    }
                }
                WeakTransportChild::DataConsumer(weak) => {
                    if let Some(data_consumer) = weak.upgrade() {
                        data_consumer.close_from_transport();
                    }
                }
            }
        }
    }
}

/// Operations common to every transport kind.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport id.
    fn id(&self) -> TransportId;

    /// Local resource id.
    fn local_id(&self) -> crate::registry::ResourceId;

    /// Id of the router owning this transport.
    fn router_id(&self) -> RouterId;

    /// App custom data.
    fn app_data(&self) -> &AppData;

    /// Whether the transport is closed.
    fn closed(&self) -> bool;

    /// Create a producer.
    async fn produce(&self, producer_options: ProducerOptions) -> Result<Producer, ProduceError>;

    /// Create a consumer of the given producer.
    async fn consume(&self, consumer_options: ConsumerOptions) -> Result<Consumer, ConsumeError>;

    /// Create a data producer.
    async fn produce_data(
        &self,
        data_producer_options: DataProducerOptions,
    ) -> Result<DataProducer, ProduceDataError>;

    /// Create a data consumer of the given data producer.
    async fn consume_data(
        &self,
        data_consumer_options: DataConsumerOptions,
    ) -> Result<DataConsumer, ConsumeDataError>;

    /// Set maximum incoming bitrate for media streams received on this
    /// transport.
    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), RequestError>;

    /// Instruct the worker to emit trace events on this transport.
    async fn enable_trace_event(
        &self,
        types: Vec<TransportTraceEventType>,
    ) -> Result<(), RequestError>;

    /// Callback called when the transport is closed; used by its children
    /// and by the owning room member.
    fn on_closed(&self, callback: Box<dyn FnOnce() + Send>) -> HandlerId;

    /// Removes a closing child from the child list.
    #[doc(hidden)]
    fn remove_child(&self, child_id: TransportChildId);

    /// Close the transport and everything created on it.
    fn close(&self);
}

/// Typed dump/stats operations; the shapes differ per transport kind.
#[async_trait]
pub trait TransportGeneric<Dump, Stat>: Transport
where
    Dump: Debug + DeserializeOwned + 'static + Send,
    Stat: Debug + DeserializeOwned + 'static + Send,
{
    /// Dump transport state.
    #[doc(hidden)]
    async fn dump(&self) -> Result<Dump, RequestError>;

    /// Transport statistics.
    async fn get_stats(&self) -> Result<Vec<Stat>, RequestError>;
}

/// Shared implementation plumbing; concrete transports provide accessors
/// and inherit the heavy operations.
#[async_trait]
pub(crate) trait TransportImpl<Dump, Stat>
where
    Dump: Debug + DeserializeOwned + 'static + Send,
    Stat: Debug + DeserializeOwned + 'static + Send,
    Self: Transport + Clone + Sized + 'static,
{
    fn router(&self) -> &Router;

    fn channel(&self) -> &Channel;

    fn payload_channel(&self) -> &PayloadChannel;

    fn executor(&self) -> &Arc<Executor<'static>>;

    fn state(&self) -> &TransportState;

    /// Whether this is a direct (in-process) transport.
    fn direct(&self) -> bool {
        false
    }

    fn get_internal(&self) -> TransportInternal {
        TransportInternal {
            router_id: self.router_id(),
            transport_id: self.id(),
        }
    }

    /// Next `mid` for a consumer created on this transport; wraps at one
    /// hundred million.
    fn next_mid(&self) -> usize {
        let mid = self
            .state()
            .next_mid_for_consumers
            .fetch_add(1, Ordering::Relaxed);
        if mid >= MID_MAX {
            warn!("consumer mid counter reached its limit, wrapping to zero");
            self.state()
                .next_mid_for_consumers
                .store(1, Ordering::Relaxed);
            0
        } else {
            mid
        }
    }

    async fn dump_impl(&self) -> Result<Dump, RequestError> {
        self.channel()
            .request(TransportDumpRequest {
                internal: self.get_internal(),
                phantom_data: PhantomData::<Dump>,
            })
            .await
    }

    async fn get_stats_impl(&self) -> Result<Vec<Stat>, RequestError> {
        self.channel()
            .request(TransportGetStatsRequest {
                internal: self.get_internal(),
                phantom_data: PhantomData::<Vec<Stat>>,
            })
            .await
    }

    async fn set_max_incoming_bitrate_impl(&self, bitrate: u32) -> Result<(), RequestError> {
        self.channel()
            .request(TransportSetMaxIncomingBitrateRequest {
                internal: self.get_internal(),
                data: TransportSetMaxIncomingBitrateData { bitrate },
            })
            .await
    }

    async fn enable_trace_event_impl(
        &self,
        types: Vec<TransportTraceEventType>,
    ) -> Result<(), RequestError> {
        self.channel()
            .request(TransportEnableTraceEventRequest {
                internal: self.get_internal(),
                data: TransportEnableTraceEventData { types },
            })
            .await
    }

    async fn produce_impl(
        &self,
        producer_options: ProducerOptions,
    ) -> Result<Producer, ProduceError> {
        let ProducerOptions {
            kind,
            rtp_parameters,
            paused,
            key_frame_request_delay,
            app_data,
        } = producer_options;

        let router_capabilities = self.router().rtp_capabilities().clone();
        let rtp_mapping =
            ortc::get_producer_rtp_parameters_mapping(&rtp_parameters, &router_capabilities)
                .map_err(ProduceError::FailedRtpParametersMapping)?;
        let consumable_rtp_parameters = ortc::get_consumable_rtp_parameters(
            kind,
            &rtp_parameters,
            &router_capabilities,
            &rtp_mapping,
        );

        let producer_id = ProducerId::new();
        let response = self
            .channel()
            .request(TransportProduceRequest {
                internal: ProducerInternal {
                    router_id: self.router_id(),
                    transport_id: self.id(),
                    producer_id,
                },
                data: TransportProduceData {
                    kind,
                    rtp_parameters: rtp_parameters.clone(),
                    rtp_mapping,
                    key_frame_request_delay,
                    paused,
                },
            })
            .await
            .map_err(ProduceError::Request)?;

        let transport: Arc<dyn Transport> = Arc::new(self.clone());
        let producer = Producer::new(
            producer_id,
            kind,
            response.r#type,
            rtp_parameters,
            consumable_rtp_parameters,
            paused,
            Arc::clone(self.executor()),
            self.channel().clone(),
            self.payload_channel().clone(),
            app_data,
            transport,
            self.router().clone(),
            self.direct(),
        );

        self.state().children.lock().push((
            TransportChildId::Producer(producer_id),
            WeakTransportChild::Producer(producer.downgrade()),
        ));

        Ok(producer)
    }

    async fn consume_impl(
        &self,
        consumer_options: ConsumerOptions,
    ) -> Result<Consumer, ConsumeError> {
        let ConsumerOptions {
            producer_id,
            rtp_capabilities,
            paused,
            preferred_layers,
            resume_by_producer,
            app_data,
        } = consumer_options;

        let producer = match self
            .router()
            .registry()
            .get_by_uuid(&uuid::Uuid::from(producer_id))
        {
            Some(Resource::Producer(producer)) => producer,
            _ => return Err(ConsumeError::ProducerNotFound(producer_id)),
        };

        let mut rtp_parameters = ortc::get_consumer_rtp_parameters(
            producer.consumable_rtp_parameters(),
            &rtp_capabilities,
        )
        .map_err(ConsumeError::BadConsumerRtpParameters)?;
        rtp_parameters.mid = Some(format!("{}", self.next_mid()));

        let consumer_id = ConsumerId::new();
        let r#type = producer.r#type().into();
        let response = self
            .channel()
            .request(TransportConsumeRequest {
                internal: ConsumerInternal {
                    router_id: self.router_id(),
                    transport_id: self.id(),
                    consumer_id,
                    producer_id,
                },
                data: TransportConsumeData {
                    kind: producer.kind(),
                    rtp_parameters: rtp_parameters.clone(),
                    r#type,
                    consumable_rtp_encodings: producer
                        .consumable_rtp_parameters()
                        .encodings
                        .clone(),
                    paused,
                    preferred_layers,
                },
            })
            .await
            .map_err(ConsumeError::Request)?;

        let transport: Arc<dyn Transport> = Arc::new(self.clone());
        let consumer = Consumer::new(
            consumer_id,
            producer.clone(),
            producer.kind(),
            r#type,
            rtp_parameters,
            response.paused,
            response.producer_paused,
            response.score,
            response.preferred_layers,
            resume_by_producer,
            Arc::clone(self.executor()),
            self.channel().clone(),
            self.payload_channel().clone(),
            app_data,
            transport,
            self.router().clone(),
        );

        self.state().children.lock().push((
            TransportChildId::Consumer(consumer_id),
            WeakTransportChild::Consumer(consumer.downgrade()),
        ));

        Ok(consumer)
    }

    async fn produce_data_impl(
        &self,
        r#type: DataProducerType,
        data_producer_options: DataProducerOptions,
    ) -> Result<DataProducer, ProduceDataError> {
        let DataProducerOptions {
            sctp_stream_parameters,
            label,
            protocol,
            app_data,
        } = data_producer_options;

        match r#type {
            DataProducerType::Sctp => {
                if sctp_stream_parameters.is_none() {
                    return Err(ProduceDataError::SctpStreamParametersRequired);
                }
            }
            DataProducerType::Direct => {
                if sctp_stream_parameters.is_some() {
                    return Err(ProduceDataError::SctpStreamParametersNotAllowed);
                }
            }
        }

        let data_producer_id = DataProducerId::new();
        let response = self
            .channel()
            .request(TransportProduceDataRequest {
                internal: DataProducerInternal {
                    router_id: self.router_id(),
                    transport_id: self.id(),
                    data_producer_id,
                },
                data: TransportProduceDataData {
                    r#type,
                    sctp_stream_parameters,
                    label,
                    protocol,
                },
            })
            .await
            .map_err(ProduceDataError::Request)?;

        let transport: Arc<dyn Transport> = Arc::new(self.clone());
        let data_producer = DataProducer::new(
            data_producer_id,
            response.r#type,
            response.sctp_stream_parameters,
            response.label,
            response.protocol,
            Arc::clone(self.executor()),
            self.channel().clone(),
            self.payload_channel().clone(),
            app_data,
            transport,
            self.router().clone(),
            self.direct(),
        );

        self.state().children.lock().push((
            TransportChildId::DataProducer(data_producer_id),
            WeakTransportChild::DataProducer(data_producer.downgrade()),
        ));

        Ok(data_producer)
    }

    async fn consume_data_impl(
        &self,
        r#type: DataConsumerType,
        data_consumer_options: DataConsumerOptions,
    ) -> Result<DataConsumer, ConsumeDataError> {
        let DataConsumerOptions {
            data_producer_id,
            ordered,
            max_packet_life_time,
            max_retransmits,
            app_data,
        } = data_consumer_options;

        let data_producer = match self
            .router()
            .registry()
            .get_by_uuid(&uuid::Uuid::from(data_producer_id))
        {
            Some(Resource::DataProducer(data_producer)) => data_producer,
            _ => return Err(ConsumeDataError::DataProducerNotFound(data_producer_id)),
        };

        let sctp_stream_parameters = match r#type {
            DataConsumerType::Sctp => {
                let stream_id = self
                    .state()
                    .sctp_stream_slots
                    .lock()
                    .allocate()
                    .ok_or(ConsumeDataError::NoSctpStreamId)?;
                let mut parameters = data_producer
                    .sctp_stream_parameters()
                    .unwrap_or_else(|| SctpStreamParameters::new_ordered(stream_id));
                parameters.stream_id = stream_id;
                if let Some(ordered) = ordered {
                    parameters.ordered = ordered;
                }
                if max_packet_life_time.is_some() {
                    parameters.max_packet_life_time = max_packet_life_time;
                }
                if max_retransmits.is_some() {
                    parameters.max_retransmits = max_retransmits;
                }
                Some(parameters)
            }
            DataConsumerType::Direct => None,
        };

        let data_consumer_id = DataConsumerId::new();
        let response = self
            .channel()
            .request(TransportConsumeDataRequest {
                internal: DataConsumerInternal {
                    router_id: self.router_id(),
                    transport_id: self.id(),
                    data_producer_id,
                    data_consumer_id,
                },
                data: TransportConsumeDataData {
                    r#type,
                    sctp_stream_parameters,
                    label: data_producer.label().clone(),
                    protocol: data_producer.protocol().clone(),
                },
            })
            .await
            .map_err(ConsumeDataError::Request)?;

        let transport: Arc<dyn Transport> = Arc::new(self.clone());
        let data_consumer = DataConsumer::new(
            data_consumer_id,
            response.r#type,
            response.sctp_stream_parameters,
            response.label,
            response.protocol,
            data_producer.clone(),
            Arc::clone(self.executor()),
            self.channel().clone(),
            self.payload_channel().clone(),
            app_data,
            transport,
            self.router().clone(),
        );

        self.state().children.lock().push((
            TransportChildId::DataConsumer(data_consumer_id),
            WeakTransportChild::DataConsumer(data_consumer.downgrade()),
        ));

        Ok(data_consumer)
    }

    /// Emits the creation events shared by all transports.
    fn notify_created(&self) {
        self.router()
            .event_bus()
            .emit(EventKind::TransportCreated, self.local_id(), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sctp_stream_ids_are_unique_and_bounded() {
        let mut slots = SctpStreamSlots::new(8);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..8 {
            let id = slots.allocate().unwrap();
            assert!(id < 8);
            assert!(seen.insert(id), "id {} allocated twice", id);
        }
        assert_eq!(slots.allocate(), None);
        assert_eq!(slots.in_use(), 8);
    }

    #[test]
    fn sctp_allocation_with_zero_slots_always_fails() {
        let mut slots = SctpStreamSlots::new(0);
        assert_eq!(slots.allocate(), None);
    }
}
