//! Shipment worklist: turns raw `shipments` records into worklist rows and
//! reduces rows into the KPI strip.

use change_sync::{KeySpec, KeyedRow, RowCollection, TransformError, ViewModel};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Asia/Dubai has no DST; UTC+4 all year.
const DUBAI_OFFSET_SECS: i32 = 4 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Gate {
    Green,
    Amber,
    Red,
    Zero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowKind {
    Shipment,
    Warehouse,
    Cost,
    Exception,
    Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerBadge {
    DoMissing,
    CustomsStartMissing,
    DeliveryDateMissing,
    BlMissing,
    IncotermMissing,
    HsRisk,
    DemdetRisk,
    FlowCodeViolation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shpt_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wh_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_no: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorklistRow {
    pub id: String,
    pub kind: RowKind,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    pub gate: Gate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerBadge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_code_original: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_override_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_location: Option<String>,
    #[serde(default, rename = "ref")]
    pub reference: RowRef,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

impl KeyedRow for WorklistRow {
    fn primary_key(&self) -> &str {
        &self.id
    }

    fn secondary_key(&self) -> Option<&str> {
        self.meta.get("shipment_id").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kpis {
    pub dri_avg: f64,
    pub wsi_avg: f64,
    pub red_count: usize,
    pub overdue_count: usize,
    #[serde(rename = "recoverableAED")]
    pub recoverable_aed: f64,
    pub zero_stops: usize,
}

#[derive(Debug, Default, Deserialize)]
struct WarehouseDates {
    mosb: Option<String>,
    dsv_indoor: Option<String>,
    dsv_outdoor: Option<String>,
    dsv_mzd: Option<String>,
    jdn_mzd: Option<String>,
    jdn_waterfront: Option<String>,
    project_shu2: Option<String>,
    project_mir3: Option<String>,
    project_das4: Option<String>,
    project_agi5: Option<String>,
}

/// A `shipments` table record as it arrives from the change feed.
#[derive(Debug, Deserialize)]
struct ShipmentRecord {
    id: Option<Value>,
    sct_ship_no: Option<String>,
    commercial_invoice_no: Option<String>,
    invoice_date: Option<String>,
    vendor: Option<String>,
    port_of_loading: Option<String>,
    port_of_discharge: Option<String>,
    vessel_name: Option<String>,
    bl_awb_no: Option<String>,
    ship_mode: Option<String>,
    coe: Option<String>,
    etd: Option<String>,
    eta: Option<String>,
    do_collection_date: Option<String>,
    customs_start_date: Option<String>,
    customs_close_date: Option<String>,
    delivery_date: Option<String>,
    duty_amount_aed: Option<f64>,
    vat_amount_aed: Option<f64>,
    incoterms: Option<String>,
    flow_code: Option<i64>,
    flow_code_original: Option<i64>,
    flow_override_reason: Option<String>,
    final_location: Option<String>,
    warehouse_inventory: Option<WarehouseDates>,
}

pub struct WorklistModel {
    keys: KeySpec,
    today: Option<NaiveDate>,
}

impl Default for WorklistModel {
    fn default() -> Self {
        Self::new()
    }
}

impl WorklistModel {
    pub fn new() -> Self {
        Self {
            keys: KeySpec::new("id").with_secondary("shipment_id"),
            today: None,
        }
    }

    /// Pins "today" instead of reading the Dubai wall clock.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(dubai_today)
    }
}

impl ViewModel for WorklistModel {
    type Row = WorklistRow;
    type Summary = Kpis;

    fn key_spec(&self) -> &KeySpec {
        &self.keys
    }

    fn transform(&self, record: &Value) -> Result<WorklistRow, TransformError> {
        let shipment: ShipmentRecord = serde_json::from_value(record.clone())
            .map_err(|err| TransformError::Malformed(err.to_string()))?;
        shipment_to_row(shipment, self.today())
    }

    fn summarize(&self, rows: &RowCollection<WorklistRow>) -> Kpis {
        calculate_kpis(rows.as_slice(), self.today())
    }
}

pub fn dubai_now() -> DateTime<FixedOffset> {
    match FixedOffset::east_opt(DUBAI_OFFSET_SECS) {
        Some(offset) => Utc::now().with_timezone(&offset),
        None => Utc::now().fixed_offset(),
    }
}

pub fn dubai_today() -> NaiveDate {
    dubai_now().date_naive()
}

/// Local Dubai wall-clock string, `YYYY-MM-DD HH:MM`.
pub fn dubai_timestamp(at: DateTime<Utc>) -> String {
    match FixedOffset::east_opt(DUBAI_OFFSET_SECS) {
        Some(offset) => at.with_timezone(&offset).format("%Y-%m-%d %H:%M").to_string(),
        None => at.format("%Y-%m-%d %H:%M").to_string(),
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map(str::trim).map_or(true, str::is_empty)
}

fn parse_instant(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

fn parse_date(raw: &Option<String>) -> Option<NaiveDate> {
    raw.as_deref().and_then(parse_instant).map(|ts| ts.date())
}

pub fn dri_score(shipment_fields: &[&Option<String>]) -> f64 {
    if shipment_fields.is_empty() {
        return 0.0;
    }
    let present = shipment_fields.iter().filter(|field| !is_blank(field)).count();
    round2(present as f64 / shipment_fields.len() as f64 * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn gate_and_triggers(shipment: &ShipmentRecord, today: NaiveDate) -> (Gate, Vec<TriggerBadge>) {
    let mut triggers = Vec::new();
    if is_blank(&shipment.do_collection_date) {
        triggers.push(TriggerBadge::DoMissing);
    }
    if is_blank(&shipment.customs_start_date) {
        triggers.push(TriggerBadge::CustomsStartMissing);
    }
    if is_blank(&shipment.delivery_date) {
        triggers.push(TriggerBadge::DeliveryDateMissing);
    }
    if is_blank(&shipment.bl_awb_no) {
        triggers.push(TriggerBadge::BlMissing);
    }
    if is_blank(&shipment.incoterms) {
        triggers.push(TriggerBadge::IncotermMissing);
    }
    let offshore = matches!(shipment.final_location.as_deref(), Some("AGI") | Some("DAS"));
    if offshore && shipment.flow_code.is_some_and(|code| code < 3) {
        triggers.push(TriggerBadge::FlowCodeViolation);
    }

    let eta_passed = parse_date(&shipment.eta).is_some_and(|eta| eta < today);
    let has = |badge: TriggerBadge| triggers.contains(&badge);
    let gate = if eta_passed
        && (has(TriggerBadge::DoMissing) || has(TriggerBadge::CustomsStartMissing))
    {
        Gate::Red
    } else if eta_passed && has(TriggerBadge::DeliveryDateMissing) {
        Gate::Amber
    } else if has(TriggerBadge::FlowCodeViolation) {
        Gate::Zero
    } else {
        Gate::Green
    };
    (gate, triggers)
}

/// Label of the warehouse with the most recent date; earlier entries win ties.
fn current_location(dates: &WarehouseDates) -> Option<String> {
    let candidates = [
        ("MOSB", &dates.mosb),
        ("DSV Indoor", &dates.dsv_indoor),
        ("DSV Outdoor", &dates.dsv_outdoor),
        ("DSV MZD", &dates.dsv_mzd),
        ("JDN MZD", &dates.jdn_mzd),
        ("JDN Waterfront", &dates.jdn_waterfront),
        ("SHU", &dates.project_shu2),
        ("MIR", &dates.project_mir3),
        ("DAS", &dates.project_das4),
        ("AGI", &dates.project_agi5),
    ];
    let mut best: Option<(NaiveDateTime, &str)> = None;
    for (label, raw) in candidates {
        let Some(at) = raw.as_deref().and_then(parse_instant) else {
            continue;
        };
        if best.map_or(true, |(current, _)| at > current) {
            best = Some((at, label));
        }
    }
    best.map(|(_, label)| label.to_string())
}

fn record_id(raw: Option<Value>) -> Result<String, TransformError> {
    match raw {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(id),
        Some(Value::Number(id)) => Ok(id.to_string()),
        Some(other) => Err(TransformError::InvalidField {
            field: "id".into(),
            reason: format!("expected string or number, got {other}"),
        }),
        None => Err(TransformError::MissingField("id".into())),
    }
}

fn shipment_to_row(shipment: ShipmentRecord, today: NaiveDate) -> Result<WorklistRow, TransformError> {
    let id = record_id(shipment.id.clone())?;
    let title = shipment
        .sct_ship_no
        .clone()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| TransformError::MissingField("sct_ship_no".into()))?;

    let score = dri_score(&[
        &shipment.commercial_invoice_no,
        &shipment.invoice_date,
        &shipment.coe,
        &shipment.bl_awb_no,
        &shipment.vessel_name,
        &shipment.etd,
        &shipment.eta,
        &shipment.do_collection_date,
        &shipment.customs_start_date,
    ]);
    let (gate, triggers) = gate_and_triggers(&shipment, today);
    let location = shipment.warehouse_inventory.as_ref().and_then(current_location);

    let mut parts: Vec<String> = [&shipment.vendor, &shipment.ship_mode, &shipment.port_of_loading]
        .into_iter()
        .filter(|value| !is_blank(value))
        .filter_map(|value| value.clone())
        .collect();
    if let Some(discharge) = shipment.port_of_discharge.as_deref().filter(|v| !v.trim().is_empty()) {
        parts.push(format!("→{discharge}"));
    }
    let subtitle = (!parts.is_empty()).then(|| parts.join(" · "));

    let eta = parse_date(&shipment.eta);
    let due_at = parse_date(&shipment.delivery_date).or(eta);

    let mut meta = Map::new();
    meta.insert("vendor".into(), json_opt(&shipment.vendor));
    meta.insert("incoterms".into(), json_opt(&shipment.incoterms));
    meta.insert("bl_awb".into(), json_opt(&shipment.bl_awb_no));
    meta.insert("do_collection".into(), json_date(&shipment.do_collection_date));
    meta.insert("customs_start".into(), json_date(&shipment.customs_start_date));
    meta.insert("customs_close".into(), json_date(&shipment.customs_close_date));
    meta.insert("duty_aed".into(), json_number(shipment.duty_amount_aed));
    meta.insert("vat_aed".into(), json_number(shipment.vat_amount_aed));

    Ok(WorklistRow {
        id,
        kind: RowKind::Shipment,
        title: title.clone(),
        subtitle,
        gate,
        score: Some(score),
        due_at,
        eta,
        current_location: location,
        triggers,
        flow_code: shipment.flow_code,
        flow_code_original: shipment.flow_code_original,
        flow_override_reason: shipment.flow_override_reason,
        final_location: shipment.final_location,
        reference: RowRef {
            shpt_no: Some(title),
            wh_name: None,
            invoice_no: shipment
                .commercial_invoice_no
                .filter(|value| !value.trim().is_empty()),
        },
        meta,
    })
}

fn json_opt(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

fn json_date(value: &Option<String>) -> Value {
    parse_date(value)
        .map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
        .unwrap_or(Value::Null)
}

fn json_number(value: Option<f64>) -> Value {
    value
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

pub fn calculate_kpis(rows: &[WorklistRow], today: NaiveDate) -> Kpis {
    let shipments: Vec<&WorklistRow> = rows
        .iter()
        .filter(|row| row.kind == RowKind::Shipment)
        .collect();
    if shipments.is_empty() {
        return Kpis::default();
    }

    let total_score: f64 = shipments.iter().map(|row| row.score.unwrap_or(0.0)).sum();
    let recoverable: f64 = shipments
        .iter()
        .map(|row| meta_number(row, "duty_aed") + meta_number(row, "vat_aed"))
        .sum();

    Kpis {
        dri_avg: round2(total_score / shipments.len() as f64),
        wsi_avg: 0.0,
        red_count: shipments.iter().filter(|row| row.gate == Gate::Red).count(),
        overdue_count: shipments
            .iter()
            .filter(|row| row.due_at.is_some_and(|due| due < today))
            .count(),
        recoverable_aed: round2(recoverable),
        zero_stops: shipments.iter().filter(|row| row.gate == Gate::Zero).count(),
    }
}

fn meta_number(row: &WorklistRow, key: &str) -> f64 {
    row.meta.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}
