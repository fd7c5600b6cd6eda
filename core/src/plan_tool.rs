use crate::codex::Session;
use crate::function_tool::FunctionCallError;
use crate::protocol::Event;
use crate::protocol::EventMsg;

use codex_protocol::plan_tool::StepStatus;
use codex_protocol::plan_tool::UpdatePlanArgs;

/// The plan itself is only useful to clients, which render the
/// `PlanUpdate` event; the model just gets an acknowledgement.
pub(crate) async fn handle_update_plan(
    session: &Session,
    arguments: &str,
    sub_id: &str,
) -> Result<String, FunctionCallError> {
    let args = parse_update_plan_arguments(arguments)?;
    session
        .send_event(Event {
            id: sub_id.to_string(),
            msg: EventMsg::PlanUpdate(args),
        })
        .await;
    Ok("Plan updated".to_string())
}

fn parse_update_plan_arguments(arguments: &str) -> Result<UpdatePlanArgs, FunctionCallError> {
    let args: UpdatePlanArgs = serde_json::from_str(arguments).map_err(|e| {
        FunctionCallError::RespondToModel(format!("failed to parse function arguments: {e}"))
    })?;
    let in_progress = args
        .plan
        .iter()
        .filter(|item| item.status == StepStatus::InProgress)
        .count();
    if in_progress > 1 {
        return Err(FunctionCallError::RespondToModel(format!(
            "at most one step can be in_progress, got {in_progress}"
        )));
    }
    Ok(args)
}
