//! gRPC machine API client.
//!
//! Calls are issued against the machine service with hand-rolled method
//! paths and prost codecs; the target node travels in request metadata so
//! one connection can address the whole cluster through an endpoint.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt as _, TryStreamExt as _};
use keel_machine_api::{
    ActionResponse, DataChunk, DmesgRequest, Event, EventStream, EventsRequest, MachineClient,
    ProcessInfo, ProcessesRequest, ProcessesResponse, ReadRequest, RebootRequest, ResetRequest,
    UpgradeRequest,
};
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

/// Machine API client over one gRPC channel.
#[derive(Clone)]
pub struct GrpcMachineClient {
    grpc: Grpc<Channel>,
}

impl GrpcMachineClient {
    /// Connect to the cluster endpoint.
    pub async fn connect(endpoint: String) -> anyhow::Result<Self> {
        let channel = Endpoint::from_shared(endpoint)?
            .connect_timeout(std::time::Duration::from_secs(20))
            .connect_lazy();

        Ok(Self {
            grpc: Grpc::new(channel),
        })
    }

    fn request<T>(node: &str, message: T) -> Result<Request<T>, Status> {
        let mut request = Request::new(message);

        request.metadata_mut().insert(
            "node",
            node.parse()
                .map_err(|_| Status::invalid_argument("invalid node name"))?,
        );

        Ok(request)
    }

    async fn ready(&self) -> Result<Grpc<Channel>, Status> {
        let mut grpc = self.grpc.clone();

        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;

        Ok(grpc)
    }

    async fn unary_action<T: prost::Message + Default + 'static>(
        &self,
        node: &str,
        path: &'static str,
        message: T,
    ) -> Result<String, Status> {
        let mut grpc = self.ready().await?;

        let response: tonic::Response<ActionResponse> = grpc
            .unary(
                Self::request(node, message)?,
                PathAndQuery::from_static(path),
                ProstCodec::default(),
            )
            .await?;

        Ok(response.into_inner().actor_id)
    }
}

#[async_trait]
impl MachineClient for GrpcMachineClient {
    async fn events(&self, node: &str, tail_events: i32) -> Result<EventStream, Status> {
        let mut grpc = self.ready().await?;

        let response = grpc
            .server_streaming(
                Self::request(node, EventsRequest { tail_events })?,
                PathAndQuery::from_static("/machine.MachineService/Events"),
                ProstCodec::<EventsRequest, Event>::default(),
            )
            .await?;

        Ok(Box::pin(response.into_inner()))
    }

    async fn read_file(&self, node: &str, path: &str) -> Result<Vec<u8>, Status> {
        let mut grpc = self.ready().await?;

        let response = grpc
            .server_streaming(
                Self::request(
                    node,
                    ReadRequest {
                        path: path.to_string(),
                    },
                )?,
                PathAndQuery::from_static("/machine.MachineService/Read"),
                ProstCodec::<ReadRequest, DataChunk>::default(),
            )
            .await?;

        let chunks: Vec<DataChunk> = response.into_inner().try_collect().await?;

        Ok(chunks.into_iter().flat_map(|c| c.bytes).collect())
    }

    async fn dmesg(
        &self,
        node: &str,
        follow: bool,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<Vec<u8>, Status>> + Send>>, Status> {
        let mut grpc = self.ready().await?;

        let response = grpc
            .server_streaming(
                Self::request(node, DmesgRequest { follow })?,
                PathAndQuery::from_static("/machine.MachineService/Dmesg"),
                ProstCodec::<DmesgRequest, DataChunk>::default(),
            )
            .await?;

        Ok(Box::pin(
            response.into_inner().map(|chunk| chunk.map(|c| c.bytes)),
        ))
    }

    async fn processes(&self, node: &str) -> Result<Vec<ProcessInfo>, Status> {
        let mut grpc = self.ready().await?;

        let response: tonic::Response<ProcessesResponse> = grpc
            .unary(
                Self::request(node, ProcessesRequest {})?,
                PathAndQuery::from_static("/machine.MachineService/Processes"),
                ProstCodec::default(),
            )
            .await?;

        Ok(response.into_inner().processes)
    }

    async fn reboot(&self, node: &str) -> Result<String, Status> {
        self.unary_action(node, "/machine.MachineService/Reboot", RebootRequest {})
            .await
    }

    async fn reset(&self, node: &str, graceful: bool) -> Result<String, Status> {
        self.unary_action(
            node,
            "/machine.MachineService/Reset",
            ResetRequest { graceful },
        )
        .await
    }

    async fn upgrade(&self, node: &str, image: &str) -> Result<String, Status> {
        self.unary_action(
            node,
            "/machine.MachineService/Upgrade",
            UpgradeRequest {
                image: image.to_string(),
            },
        )
        .await
    }
}
