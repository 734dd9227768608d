use std::sync::Arc;

use api_types::ExtenderArgs;
use api_types::ExtenderFilterResult;
use api_types::ExtenderPreemptionArgs;
use api_types::ExtenderPreemptionResult;
use api_types::HostPriority;
use poem::handler;
use poem::web::Data;
use poem::web::Json;

use crate::domain::scheduler::SchedulerService;

#[handler]
pub async fn filter(
    service: Data<&Arc<SchedulerService>>,
    Json(args): Json<ExtenderArgs>,
) -> Json<ExtenderFilterResult> {
    Json(service.filter(args).await)
}

#[handler]
pub async fn prioritize(
    service: Data<&Arc<SchedulerService>>,
    Json(args): Json<ExtenderArgs>,
) -> Json<Vec<HostPriority>> {
    Json(service.prioritize(args).await)
}

#[handler]
pub async fn preempt(
    service: Data<&Arc<SchedulerService>>,
    Json(args): Json<ExtenderPreemptionArgs>,
) -> Json<ExtenderPreemptionResult> {
    Json(service.preempt(args).await)
}
