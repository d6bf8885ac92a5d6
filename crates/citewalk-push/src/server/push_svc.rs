//! `PushService` gRPC implementation.
//!
//! Device registration and notification intake. Delivery itself happens
//! asynchronously in the worker; callers only learn whether their request
//! was recorded.

use tonic::{Request, Response, Status};
use tracing::{info, instrument, warn};

use citewalk_proto::v1::push_service_server::PushService;
use citewalk_proto::v1::{
    DevicePlatform, EnqueueNotificationRequest, EnqueueNotificationResponse,
    NotificationPriority, ProviderEnvironment as ProtoEnvironment, PushProvider,
    RegisterDeviceRequest, RegisterDeviceResponse, UnregisterDeviceRequest,
    UnregisterDeviceResponse,
};

use crate::outbox::{NewNotification, PushOutbox};
use crate::storage::{Platform, Priority, Provider, ProviderEnvironment};
use crate::tokens::{RegisterDevice, TokenStore};

/// gRPC service for device registrations and notification intake.
pub struct PushServiceImpl {
    tokens: TokenStore,
    outbox: PushOutbox,
}

impl PushServiceImpl {
    pub const fn new(tokens: TokenStore, outbox: PushOutbox) -> Self {
        Self { tokens, outbox }
    }
}

fn provider_from_proto(provider: i32) -> Result<Provider, Status> {
    match PushProvider::try_from(provider) {
        Ok(PushProvider::Apple) => Ok(Provider::Apple),
        Ok(PushProvider::Google) => Ok(Provider::Google),
        Ok(PushProvider::Unspecified) | Err(_) => {
            Err(Status::invalid_argument("Provider must be APPLE or GOOGLE"))
        }
    }
}

fn platform_from_proto(platform: i32) -> Result<Platform, Status> {
    match DevicePlatform::try_from(platform) {
        Ok(DevicePlatform::Android) => Ok(Platform::Android),
        Ok(DevicePlatform::Ios) => Ok(Platform::Ios),
        Ok(DevicePlatform::Unspecified) | Err(_) => {
            Err(Status::invalid_argument("Platform must be ANDROID or IOS"))
        }
    }
}

fn environment_from_proto(environment: i32) -> Result<Option<ProviderEnvironment>, Status> {
    match ProtoEnvironment::try_from(environment) {
        Ok(ProtoEnvironment::Unspecified) => Ok(None),
        Ok(ProtoEnvironment::Sandbox) => Ok(Some(ProviderEnvironment::Sandbox)),
        Ok(ProtoEnvironment::Production) => Ok(Some(ProviderEnvironment::Production)),
        Err(_) => Err(Status::invalid_argument("Unknown provider environment")),
    }
}

fn priority_from_proto(priority: i32) -> Result<Priority, Status> {
    match NotificationPriority::try_from(priority) {
        Ok(NotificationPriority::Normal) => Ok(Priority::Normal),
        Ok(NotificationPriority::High) => Ok(Priority::High),
        Err(_) => Err(Status::invalid_argument("Unknown notification priority")),
    }
}

#[tonic::async_trait]
impl PushService for PushServiceImpl {
    #[instrument(skip(self, request), fields(rpc = "RegisterDevice"))]
    async fn register_device(
        &self,
        request: Request<RegisterDeviceRequest>,
    ) -> Result<Response<RegisterDeviceResponse>, Status> {
        let req = request.into_inner();

        if req.token.is_empty() {
            return Err(Status::invalid_argument("token is required"));
        }
        if req.user_id.is_empty() {
            return Err(Status::invalid_argument("user_id is required"));
        }

        let registration = RegisterDevice {
            user_id: req.user_id,
            provider: provider_from_proto(req.provider)?,
            token: req.token,
            platform: platform_from_proto(req.platform)?,
            device_id: req.device_id,
            app_version: req.app_version,
            locale: req.locale,
            environment: environment_from_proto(req.environment)?,
        };

        match self.tokens.register(&registration).await {
            Ok(_) => Ok(Response::new(RegisterDeviceResponse { success: true })),
            Err(e) => {
                warn!(error = %e, "Failed to register device");
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self, request), fields(rpc = "UnregisterDevice"))]
    async fn unregister_device(
        &self,
        request: Request<UnregisterDeviceRequest>,
    ) -> Result<Response<UnregisterDeviceResponse>, Status> {
        let req = request.into_inner();

        if req.token.is_empty() {
            return Err(Status::invalid_argument("token is required"));
        }
        let provider = provider_from_proto(req.provider)?;

        match self.tokens.unregister(provider, &req.token).await {
            Ok(removed) => {
                if !removed {
                    info!("Device not found (already unregistered)");
                }
                Ok(Response::new(UnregisterDeviceResponse { success: removed }))
            }
            Err(e) => {
                warn!(error = %e, "Failed to unregister device");
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self, request), fields(rpc = "EnqueueNotification"))]
    async fn enqueue_notification(
        &self,
        request: Request<EnqueueNotificationRequest>,
    ) -> Result<Response<EnqueueNotificationResponse>, Status> {
        let req = request.into_inner();

        let notification = NewNotification {
            recipient_id: req.recipient_id,
            kind: req.kind,
            title: req.title,
            body: req.body,
            payload: req.payload.into_iter().collect(),
            priority: priority_from_proto(req.priority)?,
        };

        match self.outbox.enqueue(&notification).await {
            Ok(item) => Ok(Response::new(EnqueueNotificationResponse { id: item.id })),
            Err(e) => {
                warn!(error = %e, "Failed to enqueue notification");
                Err(e.into())
            }
        }
    }
}
