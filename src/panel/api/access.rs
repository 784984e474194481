// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Per-server sub-users, schedules, databases and addons

use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::info;

use super::{ok_data, ok_message, require_owner, require_permission, require_visible};
use crate::error::{AxisError, Result};
use crate::panel::addons::{self, find_source};
use crate::panel::permissions::*;
use crate::panel::scheduler::{next_fire, parse_cron, validate_tasks};
use crate::panel::store::{new_id, Schedule, SubUser, Task};
use crate::panel::PanelState;

// ─── Sub-users ───

#[derive(Deserialize)]
pub struct AddSubUser {
    /// User id or username
    pub user: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Deserialize)]
pub struct Permissions {
    pub permissions: Vec<String>,
}

pub async fn list_subusers(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_owner(&req, &state, &path)?;
    let subs: Vec<SubUser> = state.store.read(|d| d.subusers.values().filter(|s| s.server_id == *path).cloned().collect());
    Ok(ok_data(subs))
}

pub async fn add_subuser(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>, body: web::Json<AddSubUser>) -> Result<HttpResponse> {
    require_owner(&req, &state, &path)?;
    let AddSubUser { user, permissions } = body.into_inner();
    validate_permissions(&permissions)?;
    let user_id = state.store.read(|d| {
        d.users.values()
            .find(|u| u.id == user || u.username.eq_ignore_ascii_case(&user))
            .map(|u| u.id.clone())
    }).ok_or_else(|| AxisError::not_found("User not found"))?;
    let sub = state.store.add_subuser(SubUser { id: new_id(), server_id: path.to_string(), user_id, permissions })?;
    info!("Sub-user {} added to {}", sub.user_id, sub.server_id);
    Ok(HttpResponse::Created().json(serde_json::json!({ "success": true, "data": sub })))
}

pub async fn get_subuser(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (id, user_id) = path.into_inner();
    require_owner(&req, &state, &id)?;
    let sub = state.store.read(|d| d.subusers.values().find(|s| s.server_id == id && s.user_id == user_id).cloned())
        .ok_or_else(|| AxisError::not_found("Sub-user not found"))?;
    Ok(ok_data(sub))
}

pub async fn update_subuser(
    req: HttpRequest,
    state: web::Data<PanelState>,
    path: web::Path<(String, String)>,
    body: web::Json<Permissions>,
) -> Result<HttpResponse> {
    let (id, user_id) = path.into_inner();
    require_owner(&req, &state, &id)?;
    validate_permissions(&body.permissions)?;
    let sub = state.store.write(|d| {
        let sub = d.subusers.values_mut()
            .find(|s| s.server_id == id && s.user_id == user_id)
            .ok_or_else(|| AxisError::not_found("Sub-user not found"))?;
        sub.permissions = body.permissions.clone();
        Ok(sub.clone())
    })?;
    Ok(ok_data(sub))
}

pub async fn remove_subuser(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (id, user_id) = path.into_inner();
    require_owner(&req, &state, &id)?;
    state.store.write(|d| {
        let before = d.subusers.len();
        d.subusers.retain(|_, s| !(s.server_id == id && s.user_id == user_id));
        if d.subusers.len() == before {
            return Err(AxisError::not_found("Sub-user not found"));
        }
        Ok(())
    })?;
    Ok(ok_message("Sub-user removed"))
}

// ─── Schedules ───

#[derive(Deserialize)]
pub struct ScheduleBody {
    pub name: String,
    pub cron: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub only_when_online: bool,
}

fn default_true() -> bool {
    true
}

impl ScheduleBody {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AxisError::invalid("Schedule name is required"));
        }
        parse_cron(&self.cron)?;
        validate_tasks(&self.tasks)
    }
}

fn owned_schedule(state: &PanelState, server_id: &str, sid: &str) -> Result<Schedule> {
    state.store.schedule(sid)
        .ok()
        .filter(|s| s.server_id == server_id)
        .ok_or_else(|| AxisError::not_found("Schedule not found"))
}

pub async fn list_schedules(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_permission(&req, &state, &path, SCHEDULE_LIST)?;
    let schedules: Vec<Schedule> = state.store.read(|d| d.schedules.values().filter(|s| s.server_id == *path).cloned().collect());
    Ok(ok_data(schedules))
}

pub async fn get_schedule(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (id, sid) = path.into_inner();
    require_permission(&req, &state, &id, SCHEDULE_LIST)?;
    Ok(ok_data(owned_schedule(&state, &id, &sid)?))
}

pub async fn create_schedule(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>, body: web::Json<ScheduleBody>) -> Result<HttpResponse> {
    require_permission(&req, &state, &path, SCHEDULE_CREATE)?;
    body.validate()?;
    let body = body.into_inner();
    let schedule = Schedule {
        id: new_id(),
        server_id: path.to_string(),
        name: body.name.trim().to_string(),
        next_run_at: next_fire(&body.cron, chrono::Utc::now())?,
        cron: body.cron,
        tasks: body.tasks,
        is_active: body.is_active,
        only_when_online: body.only_when_online,
        last_run_at: None,
    };
    state.store.write(|d| {
        d.schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(())
    })?;
    if schedule.is_active {
        state.scheduler.arm(&schedule.id);
    }
    info!("Schedule {} created for {}", schedule.name, schedule.server_id);
    Ok(HttpResponse::Created().json(serde_json::json!({ "success": true, "data": schedule })))
}

pub async fn update_schedule(
    req: HttpRequest,
    state: web::Data<PanelState>,
    path: web::Path<(String, String)>,
    body: web::Json<ScheduleBody>,
) -> Result<HttpResponse> {
    let (id, sid) = path.into_inner();
    require_permission(&req, &state, &id, SCHEDULE_UPDATE)?;
    owned_schedule(&state, &id, &sid)?;
    body.validate()?;
    let body = body.into_inner();
    let next = next_fire(&body.cron, chrono::Utc::now())?;
    let updated = state.store.write(|d| {
        let s = d.schedules.get_mut(&sid).ok_or_else(|| AxisError::not_found("Schedule not found"))?;
        s.name = body.name.trim().to_string();
        s.cron = body.cron;
        s.tasks = body.tasks;
        s.is_active = body.is_active;
        s.only_when_online = body.only_when_online;
        s.next_run_at = if s.is_active { next } else { None };
        Ok(s.clone())
    })?;
    if updated.is_active {
        state.scheduler.arm(&sid);
    } else {
        state.scheduler.disarm(&sid);
    }
    Ok(ok_data(updated))
}

pub async fn delete_schedule(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (id, sid) = path.into_inner();
    require_permission(&req, &state, &id, SCHEDULE_DELETE)?;
    owned_schedule(&state, &id, &sid)?;
    state.scheduler.disarm(&sid);
    state.store.write(|d| {
        d.schedules.remove(&sid);
        Ok(())
    })?;
    Ok(ok_message("Schedule deleted"))
}

/// POST /api/servers/{id}/schedules/{sid}/run
pub async fn run_schedule(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (id, sid) = path.into_inner();
    require_permission(&req, &state, &id, SCHEDULE_RUN)?;
    owned_schedule(&state, &id, &sid)?;
    state.scheduler.run_now(&sid)?;
    Ok(HttpResponse::Accepted().json(serde_json::json!({ "success": true, "message": "Schedule started" })))
}

// ─── Databases ───

#[derive(Deserialize)]
pub struct CreateDatabase {
    pub host_id: String,
    pub name: String,
}

pub async fn list_databases(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>) -> Result<HttpResponse> {
    require_permission(&req, &state, &path, DATABASE_VIEW)?;
    Ok(ok_data(state.databases.list(&path)))
}

pub async fn create_database(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>, body: web::Json<CreateDatabase>) -> Result<HttpResponse> {
    require_permission(&req, &state, &path, DATABASE_CREATE)?;
    let db = state.databases.create(&path, &body.host_id, &body.name).await?;
    Ok(HttpResponse::Created().json(serde_json::json!({ "success": true, "data": db })))
}

pub async fn get_database(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (id, db) = path.into_inner();
    require_permission(&req, &state, &id, DATABASE_VIEW)?;
    Ok(ok_data(state.databases.database(&id, &db)?))
}

pub async fn delete_database(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (id, db) = path.into_inner();
    require_permission(&req, &state, &id, DATABASE_DELETE)?;
    state.databases.delete(&id, &db).await?;
    Ok(ok_message("Database deleted"))
}

pub async fn rotate_database_password(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<(String, String)>) -> Result<HttpResponse> {
    let (id, db) = path.into_inner();
    require_permission(&req, &state, &id, DATABASE_UPDATE)?;
    Ok(ok_data(state.databases.rotate_password(&id, &db).await?))
}

// ─── Addons ───

#[derive(Deserialize)]
pub struct AddonQuery {
    pub source: String,
    #[serde(default)]
    pub q: String,
}

#[derive(Deserialize)]
pub struct InstallAddon {
    pub source: String,
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
}

fn package_sources(state: &PanelState, server_id: &str) -> Result<Vec<addons::AddonSource>> {
    let server = state.store.server(server_id)?;
    Ok(state.store.package(&server.package_id)?.addon_sources)
}

/// GET /api/servers/{id}/addons/search?source=&q=
pub async fn search_addons(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>, query: web::Query<AddonQuery>) -> Result<HttpResponse> {
    require_visible(&req, &state, &path)?;
    let sources = package_sources(&state, &path)?;
    let source = find_source(&sources, &query.source)?;
    Ok(ok_data(addons::search(source, &query.q).await?))
}

/// POST /api/servers/{id}/addons/install
pub async fn install_addon(req: HttpRequest, state: web::Data<PanelState>, path: web::Path<String>, body: web::Json<InstallAddon>) -> Result<HttpResponse> {
    require_permission(&req, &state, &path, FILE_UPLOAD)?;
    let sources = package_sources(&state, &path)?;
    let source = find_source(&sources, &body.source)?;
    addons::install(&state.client, &path, source, &body.url, body.filename.as_deref()).await?;
    Ok(ok_message("Addon installed"))
}
