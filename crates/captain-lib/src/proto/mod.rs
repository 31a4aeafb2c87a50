//! Spinner protocol messages and client
//!
//! With the `proto-gen` feature this module includes the code generated by
//! tonic-build from `proto/spinner/v1/spinner.proto`. Otherwise the
//! checked-in definitions below are used; they mirror the generated code and
//! must be kept in sync with the proto file.

#[cfg(feature = "proto-gen")]
pub mod spinner {
    pub mod v1 {
        tonic::include_proto!("spinner.v1");
    }
}

#[cfg(not(feature = "proto-gen"))]
pub mod spinner {
    pub mod v1 {
        use prost::Message;
        use std::collections::HashMap;

        #[derive(Clone, PartialEq, Message)]
        pub struct Uuid {
            #[prost(string, tag = "1")]
            pub value: String,
        }

        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
        #[repr(i32)]
        pub enum NodeRole {
            LocalServer = 0,
            Volunteer = 1,
        }

        impl NodeRole {
            pub fn as_str_name(&self) -> &'static str {
                match self {
                    NodeRole::LocalServer => "NODE_ROLE_LOCAL_SERVER",
                    NodeRole::Volunteer => "NODE_ROLE_VOLUNTEER",
                }
            }
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct JoinRequest {
            #[prost(message, optional, tag = "1")]
            pub captain_id: Option<Uuid>,
            #[prost(string, tag = "2")]
            pub ip: String,
            #[prost(double, tag = "3")]
            pub lat: f64,
            #[prost(double, tag = "4")]
            pub lon: f64,
            #[prost(enumeration = "NodeRole", tag = "5")]
            pub role: i32,
            #[prost(string, repeated, tag = "6")]
            pub tags: Vec<String>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ResourceLimits {
            #[prost(int64, tag = "1")]
            pub cpu_shares: i64,
            #[prost(int64, tag = "2")]
            pub memory_bytes: i64,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct DependencySpec {
            #[prost(string, repeated, tag = "1")]
            pub ips: Vec<String>,
            #[prost(string, repeated, tag = "2")]
            pub ports: Vec<String>,
            #[prost(message, optional, tag = "3")]
            pub app_id: Option<Uuid>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct TaskRequest {
            #[prost(message, optional, tag = "1")]
            pub task_id: Option<Uuid>,
            #[prost(message, optional, tag = "2")]
            pub app_id: Option<Uuid>,
            #[prost(string, tag = "3")]
            pub image: String,
            #[prost(string, repeated, tag = "4")]
            pub command: Vec<String>,
            #[prost(string, repeated, tag = "5")]
            pub env: Vec<String>,
            #[prost(uint32, tag = "6")]
            pub port: u32,
            #[prost(message, optional, tag = "7")]
            pub limits: Option<ResourceLimits>,
            #[prost(message, optional, tag = "8")]
            pub dependency: Option<DependencySpec>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct TaskLog {
            #[prost(message, optional, tag = "1")]
            pub task_id: Option<Uuid>,
            #[prost(string, tag = "2")]
            pub line: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct RunResponse {
            #[prost(bool, tag = "1")]
            pub success: bool,
            #[prost(string, tag = "2")]
            pub message: String,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ResourceStatus {
            #[prost(int64, tag = "1")]
            pub total: i64,
            #[prost(int64, tag = "2")]
            pub unassigned: i64,
            #[prost(int64, tag = "3")]
            pub assigned: i64,
            #[prost(double, tag = "4")]
            pub available: f64,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct ContainerStatus {
            #[prost(string, repeated, tag = "1")]
            pub active_containers: Vec<String>,
            #[prost(string, repeated, tag = "2")]
            pub images: Vec<String>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct NodeInfo {
            #[prost(message, optional, tag = "1")]
            pub captain_id: Option<Uuid>,
            #[prost(map = "string, message", tag = "2")]
            pub host_resource: HashMap<String, ResourceStatus>,
            #[prost(map = "string, string", tag = "3")]
            pub used_ports: HashMap<String, String>,
            #[prost(message, optional, tag = "4")]
            pub container_status: Option<ContainerStatus>,
            #[prost(string, repeated, tag = "5")]
            pub app_ids: Vec<String>,
            #[prost(string, repeated, tag = "6")]
            pub task_ids: Vec<String>,
            #[prost(map = "string, double", tag = "7")]
            pub task_usage: HashMap<String, f64>,
            #[prost(map = "string, int64", tag = "8")]
            pub assigned_cpu: HashMap<String, i64>,
            #[prost(string, repeated, tag = "9")]
            pub layers: Vec<String>,
            #[prost(message, optional, tag = "10")]
            pub reported_at: Option<prost_types::Timestamp>,
        }

        #[derive(Clone, PartialEq, Message)]
        pub struct UpdateResponse {
            #[prost(bool, tag = "1")]
            pub success: bool,
            #[prost(string, tag = "2")]
            pub message: String,
        }

        pub mod spinner_client {
            use super::*;
            use tonic::codegen::*;
            use tonic::transport::Uri;

            #[derive(Debug, Clone)]
            pub struct SpinnerClient<T> {
                inner: tonic::client::Grpc<T>,
            }

            impl SpinnerClient<tonic::transport::Channel> {
                pub fn new(channel: tonic::transport::Channel) -> Self {
                    let inner = tonic::client::Grpc::new(channel);
                    Self { inner }
                }
            }

            impl<T> SpinnerClient<T>
            where
                T: tonic::client::GrpcService<tonic::body::BoxBody>,
                T::Error: Into<StdError>,
                T::ResponseBody: Body<Data = Bytes> + Send + 'static,
                <T::ResponseBody as Body>::Error: Into<StdError> + Send,
            {
                pub fn with_origin(inner: T, origin: Uri) -> Self {
                    let inner = tonic::client::Grpc::with_origin(inner, origin);
                    Self { inner }
                }

                pub async fn attach(
                    &mut self,
                    request: impl tonic::IntoRequest<JoinRequest>,
                ) -> Result<tonic::Response<tonic::codec::Streaming<TaskRequest>>, tonic::Status>
                {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static("/spinner.v1.Spinner/Attach");
                    self.inner
                        .server_streaming(request.into_request(), path, codec)
                        .await
                }

                pub async fn run(
                    &mut self,
                    request: impl tonic::IntoStreamingRequest<Message = TaskLog>,
                ) -> Result<tonic::Response<RunResponse>, tonic::Status> {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static("/spinner.v1.Spinner/Run");
                    self.inner
                        .client_streaming(request.into_streaming_request(), path, codec)
                        .await
                }

                pub async fn update(
                    &mut self,
                    request: impl tonic::IntoRequest<NodeInfo>,
                ) -> Result<tonic::Response<UpdateResponse>, tonic::Status> {
                    self.inner.ready().await.map_err(|e| {
                        tonic::Status::new(
                            tonic::Code::Unknown,
                            format!("Service was not ready: {}", e.into()),
                        )
                    })?;
                    let codec = tonic::codec::ProstCodec::default();
                    let path = http::uri::PathAndQuery::from_static("/spinner.v1.Spinner/Update");
                    self.inner.unary(request.into_request(), path, codec).await
                }
            }
        }
    }
}

pub use spinner::v1::spinner_client::SpinnerClient;
pub use spinner::v1::*;

impl From<&str> for Uuid {
    fn from(value: &str) -> Self {
        Uuid {
            value: value.to_string(),
        }
    }
}

impl From<String> for Uuid {
    fn from(value: String) -> Self {
        Uuid { value }
    }
}

impl TaskRequest {
    /// Scheduler-issued task id, empty when absent
    pub fn task_id_value(&self) -> &str {
        self.task_id.as_ref().map(|id| id.value.as_str()).unwrap_or("")
    }

    /// Owning application id, empty when absent
    pub fn app_id_value(&self) -> &str {
        self.app_id.as_ref().map(|id| id.value.as_str()).unwrap_or("")
    }
}
