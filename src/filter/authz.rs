//! The external authorization filter: one request machine and, when
//! response interception is configured, one response machine per exchange.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;

use super::decoder::RequestAuthorizer;
use super::encoder::ResponseAuthorizer;
use super::{
    DataStatus, DecoderFilterCallbacks, EncoderFilterCallbacks, FilterFactory, HeadersStatus,
    MetadataStatus, StreamFilter, TrailersStatus,
};
use crate::check::{CheckClient, Metadata};
use crate::config::FilterConfig;

/// Per-exchange external authorization filter.
pub struct AuthzFilter {
    request: RequestAuthorizer,
    response: Option<ResponseAuthorizer>,
}

impl AuthzFilter {
    /// Build the filter for one exchange.
    ///
    /// `response_client` is only used when the configuration enables
    /// response interception.
    pub fn new(
        config: Arc<FilterConfig>,
        request_client: Arc<dyn CheckClient>,
        response_client: Option<Arc<dyn CheckClient>>,
        filter_name: Arc<str>,
    ) -> Self {
        let response = response_client
            .filter(|_| config.intercept_response())
            .map(|client| ResponseAuthorizer::new(config.clone(), client, filter_name.clone()));
        Self {
            request: RequestAuthorizer::new(config, request_client, filter_name),
            response,
        }
    }

    /// Factory producing a fresh filter per exchange from shared state.
    pub fn factory(
        config: Arc<FilterConfig>,
        request_client: Arc<dyn CheckClient>,
        response_client: Option<Arc<dyn CheckClient>>,
        filter_name: impl Into<Arc<str>>,
    ) -> FilterFactory {
        let filter_name = filter_name.into();
        Arc::new(move || {
            Box::new(AuthzFilter::new(
                config.clone(),
                request_client.clone(),
                response_client.clone(),
                filter_name.clone(),
            )) as Box<dyn StreamFilter>
        })
    }
}

#[async_trait]
impl StreamFilter for AuthzFilter {
    fn decode_headers(
        &mut self,
        callbacks: &mut dyn DecoderFilterCallbacks,
        end_stream: bool,
    ) -> HeadersStatus {
        self.request.decode_headers(callbacks, end_stream)
    }

    fn decode_data(
        &mut self,
        callbacks: &mut dyn DecoderFilterCallbacks,
        data: &mut Bytes,
        end_stream: bool,
    ) -> DataStatus {
        self.request.decode_data(callbacks, data, end_stream)
    }

    fn decode_trailers(
        &mut self,
        callbacks: &mut dyn DecoderFilterCallbacks,
        trailers: &mut HeaderMap,
    ) -> TrailersStatus {
        self.request.decode_trailers(callbacks, trailers)
    }

    fn decode_metadata(
        &mut self,
        _callbacks: &mut dyn DecoderFilterCallbacks,
        _metadata: &mut Metadata,
    ) -> MetadataStatus {
        if self.request.is_calling() {
            MetadataStatus::StopIteration
        } else {
            MetadataStatus::Continue
        }
    }

    async fn decode_complete(&mut self, callbacks: &mut dyn DecoderFilterCallbacks) {
        self.request.complete(callbacks).await;
    }

    fn encode_1xx_headers(
        &mut self,
        _callbacks: &mut dyn EncoderFilterCallbacks,
        _headers: &mut HeaderMap,
    ) -> HeadersStatus {
        match self.response.as_mut() {
            Some(response) => response.encode_1xx_headers(),
            None => HeadersStatus::Continue,
        }
    }

    fn encode_headers(
        &mut self,
        callbacks: &mut dyn EncoderFilterCallbacks,
        end_stream: bool,
    ) -> HeadersStatus {
        match self.response.as_mut() {
            Some(response) => response.encode_headers(callbacks, end_stream),
            None => HeadersStatus::Continue,
        }
    }

    fn encode_data(
        &mut self,
        _callbacks: &mut dyn EncoderFilterCallbacks,
        data: &mut Bytes,
        end_stream: bool,
    ) -> DataStatus {
        match self.response.as_mut() {
            Some(response) => response.encode_data(data, end_stream),
            None => DataStatus::Continue,
        }
    }

    fn encode_trailers(
        &mut self,
        _callbacks: &mut dyn EncoderFilterCallbacks,
        trailers: &mut HeaderMap,
    ) -> TrailersStatus {
        match self.response.as_mut() {
            Some(response) => response.encode_trailers(trailers),
            None => TrailersStatus::Continue,
        }
    }

    fn encode_metadata(
        &mut self,
        _callbacks: &mut dyn EncoderFilterCallbacks,
        metadata: &mut Metadata,
    ) -> MetadataStatus {
        match self.response.as_mut() {
            Some(response) => response.encode_metadata(metadata),
            None => MetadataStatus::Continue,
        }
    }

    async fn encode_complete(&mut self, callbacks: &mut dyn EncoderFilterCallbacks) {
        if let Some(response) = self.response.as_mut() {
            response.complete(callbacks).await;
        }
    }

    fn on_destroy(&mut self) {
        self.request.on_destroy();
        if let Some(response) = self.response.as_mut() {
            response.on_destroy();
        }
    }
}
