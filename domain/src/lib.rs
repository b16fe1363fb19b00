use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, SubsecRound, TimeZone, Utc,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error; // For domain-specific errors

// --- Domain Errors ---
#[derive(Error, Debug, PartialEq)]
pub enum DomainError {
    #[error("Invalid time of day {hours}:{minutes}: hours must be 0-23 and minutes 0-59")]
    InvalidTimeOfDay { hours: u32, minutes: u32 },
    #[error("Photo index {index} is out of range ({len} photos attached)")]
    PhotoIndexOutOfRange { index: usize, len: usize },
}

// --- Record ID ---

/// Opaque identifier shared by patients and appointments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives an id from the current Unix time in milliseconds.
    /// Within one process the ids are strictly increasing: a call landing in the
    /// same millisecond as the previous one takes the next free value.
    pub fn generate() -> Self {
        static LAST_GENERATED: AtomicI64 = AtomicI64::new(0);
        let now = Utc::now().timestamp_millis();
        let previous = LAST_GENERATED
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        Self(now.max(previous + 1).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Time of Day ---

/// Hour/minute pair as returned by the time picker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTimeOfDay")]
pub struct TimeOfDay {
    hours: u32,
    minutes: u32,
}

#[derive(Deserialize)]
struct RawTimeOfDay {
    hours: u32,
    minutes: u32,
}

impl TryFrom<RawTimeOfDay> for TimeOfDay {
    type Error = DomainError;

    fn try_from(raw: RawTimeOfDay) -> Result<Self, Self::Error> {
        TimeOfDay::new(raw.hours, raw.minutes)
    }
}

impl TimeOfDay {
    pub fn new(hours: u32, minutes: u32) -> Result<Self, DomainError> {
        if hours > 23 || minutes > 59 {
            return Err(DomainError::InvalidTimeOfDay { hours, minutes });
        }
        Ok(Self { hours, minutes })
    }

    pub fn hours(&self) -> u32 {
        self.hours
    }

    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    /// Minutes since midnight, used to order a day's agenda.
    pub fn sort_key(&self) -> u32 {
        self.hours * 60 + self.minutes
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hours, self.minutes)
    }
}

/// Current instant truncated to the millisecond precision of the stored ISO strings.
fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn iso_string(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// RFC 3339 first; ISO date-times without an offset and bare `YYYY-MM-DD` dates are read as UTC.
fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|day| day.and_hms_opt(0, 0, 0))
        })?;
    Some(Utc.from_utc_datetime(&naive))
}

// --- Patient ---

/// A patient record with demographic data, clinical history and attached photos.
///
/// Fields are read through accessors; changes go through [`PatientBuilder`],
/// which never touches the id.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Patient {
    id: RecordId,
    name: String,
    age: String,
    sex: String,
    document_type: String,
    document_number: String,
    civil_status: String,
    current_address: String,
    previous_address: String,
    profession: String,
    mobile_phone: String,
    landline_phone: String,
    email: String,
    /// Registration date exactly as stored. Not parsed on load; `null` reads as empty.
    #[serde(deserialize_with = "raw_or_empty")]
    date: String,
    /// An out-of-range stored time reads as absent instead of failing the whole slot.
    #[serde(deserialize_with = "valid_time_or_none", skip_serializing_if = "Option::is_none")]
    time: Option<TimeOfDay>,
    consult_reason: String,
    family_history: String,
    personal_history: String,
    current_illness_history: String,
    current_condition: String,
    diagnosis: String,
    treatment_plan: String,
    /// Local URIs in attachment order.
    photos: Vec<String>,
}

fn raw_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn valid_time_or_none<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<TimeOfDay>, D::Error> {
    let raw = Option::<RawTimeOfDay>::deserialize(deserializer)?;
    Ok(raw.and_then(|raw| TimeOfDay::try_from(raw).ok()))
}

impl Patient {
    /// Starts a new patient with a generated id, registered now.
    pub fn builder(name: impl Into<String>) -> PatientBuilder {
        PatientBuilder::new(RecordId::generate(), name)
    }

    /// Starts an edit of this record. The id and photo order carry over.
    pub fn to_builder(&self) -> PatientBuilder {
        PatientBuilder {
            record: self.clone(),
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn age(&self) -> &str {
        &self.age
    }

    pub fn sex(&self) -> &str {
        &self.sex
    }

    pub fn document_type(&self) -> &str {
        &self.document_type
    }

    pub fn document_number(&self) -> &str {
        &self.document_number
    }

    pub fn civil_status(&self) -> &str {
        &self.civil_status
    }

    pub fn current_address(&self) -> &str {
        &self.current_address
    }

    pub fn previous_address(&self) -> &str {
        &self.previous_address
    }

    pub fn profession(&self) -> &str {
        &self.profession
    }

    pub fn mobile_phone(&self) -> &str {
        &self.mobile_phone
    }

    pub fn landline_phone(&self) -> &str {
        &self.landline_phone
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// The registration date as it was stored (ISO-8601 when written by this crate).
    pub fn registration_date(&self) -> &str {
        &self.date
    }

    /// Parses the stored registration date on demand. `None` when it is not an ISO date.
    pub fn registration_instant(&self) -> Option<DateTime<Utc>> {
        parse_instant(&self.date)
    }

    pub fn registration_time(&self) -> Option<TimeOfDay> {
        self.time
    }

    pub fn consult_reason(&self) -> &str {
        &self.consult_reason
    }

    pub fn family_history(&self) -> &str {
        &self.family_history
    }

    pub fn personal_history(&self) -> &str {
        &self.personal_history
    }

    pub fn current_illness_history(&self) -> &str {
        &self.current_illness_history
    }

    pub fn current_condition(&self) -> &str {
        &self.current_condition
    }

    pub fn diagnosis(&self) -> &str {
        &self.diagnosis
    }

    pub fn treatment_plan(&self) -> &str {
        &self.treatment_plan
    }

    pub fn photos(&self) -> &[String] {
        &self.photos
    }

    /// Search rule: a blank query matches everything; otherwise the name is
    /// compared case-insensitively and the phone numbers verbatim.
    pub fn matches_query(&self, query: &str) -> bool {
        if query.trim().is_empty() {
            return true;
        }
        let needle = query.to_lowercase();
        self.name.to_lowercase().contains(&needle)
            || (!self.mobile_phone.is_empty() && self.mobile_phone.contains(query))
            || (!self.landline_phone.is_empty() && self.landline_phone.contains(query))
    }
}

/// Typed field-by-field construction and editing of a [`Patient`].
#[derive(Debug, Clone)]
pub struct PatientBuilder {
    record: Patient,
}

impl PatientBuilder {
    /// Starts a record with an explicit id, registered now.
    pub fn new(id: RecordId, name: impl Into<String>) -> Self {
        Self {
            record: Patient {
                id,
                name: name.into(),
                date: iso_string(now_millis()),
                ..Patient::default()
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.record.name = name.into();
        self
    }

    pub fn age(mut self, age: impl Into<String>) -> Self {
        self.record.age = age.into();
        self
    }

    pub fn sex(mut self, sex: impl Into<String>) -> Self {
        self.record.sex = sex.into();
        self
    }

    pub fn document(mut self, kind: impl Into<String>, number: impl Into<String>) -> Self {
        self.record.document_type = kind.into();
        self.record.document_number = number.into();
        self
    }

    pub fn civil_status(mut self, status: impl Into<String>) -> Self {
        self.record.civil_status = status.into();
        self
    }

    pub fn current_address(mut self, address: impl Into<String>) -> Self {
        self.record.current_address = address.into();
        self
    }

    pub fn previous_address(mut self, address: impl Into<String>) -> Self {
        self.record.previous_address = address.into();
        self
    }

    pub fn profession(mut self, profession: impl Into<String>) -> Self {
        self.record.profession = profession.into();
        self
    }

    pub fn mobile_phone(mut self, phone: impl Into<String>) -> Self {
        self.record.mobile_phone = phone.into();
        self
    }

    pub fn landline_phone(mut self, phone: impl Into<String>) -> Self {
        self.record.landline_phone = phone.into();
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.record.email = email.into();
        self
    }

    pub fn registered_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.date = iso_string(at.trunc_subsecs(3));
        self
    }

    pub fn registration_time(mut self, time: Option<TimeOfDay>) -> Self {
        self.record.time = time;
        self
    }

    pub fn consult_reason(mut self, text: impl Into<String>) -> Self {
        self.record.consult_reason = text.into();
        self
    }

    pub fn family_history(mut self, text: impl Into<String>) -> Self {
        self.record.family_history = text.into();
        self
    }

    pub fn personal_history(mut self, text: impl Into<String>) -> Self {
        self.record.personal_history = text.into();
        self
    }

    pub fn current_illness_history(mut self, text: impl Into<String>) -> Self {
        self.record.current_illness_history = text.into();
        self
    }

    pub fn current_condition(mut self, text: impl Into<String>) -> Self {
        self.record.current_condition = text.into();
        self
    }

    pub fn diagnosis(mut self, text: impl Into<String>) -> Self {
        self.record.diagnosis = text.into();
        self
    }

    pub fn treatment_plan(mut self, text: impl Into<String>) -> Self {
        self.record.treatment_plan = text.into();
        self
    }

    /// Appends one photo reference after the existing ones.
    pub fn add_photo(mut self, uri: impl Into<String>) -> Self {
        self.record.photos.push(uri.into());
        self
    }

    /// Appends several references (e.g. a multi-select from the gallery) in the given order.
    pub fn add_photos<I, S>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.record.photos.extend(uris.into_iter().map(Into::into));
        self
    }

    /// Removes the photo at `index`, keeping the relative order of the rest.
    pub fn remove_photo(mut self, index: usize) -> Result<Self, DomainError> {
        let len = self.record.photos.len();
        if index >= len {
            return Err(DomainError::PhotoIndexOutOfRange { index, len });
        }
        self.record.photos.remove(index);
        Ok(self)
    }

    pub fn build(self) -> Patient {
        self.record
    }
}

// --- Appointment ---

/// A scheduled visit. The patient name is free text, not a reference to a [`Patient`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    id: RecordId,
    #[serde(default)]
    patient_name: String,
    /// Re-hydrated to a timestamp on load; a missing or blank date becomes "now".
    #[serde(
        default = "now_millis",
        serialize_with = "serialize_date",
        deserialize_with = "rehydrate_date"
    )]
    date: DateTime<Utc>,
    time: TimeOfDay,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
}

fn serialize_date<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&iso_string(*date))
}

fn rehydrate_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(now_millis()),
        Some(text) => parse_instant(text)
            .ok_or_else(|| serde::de::Error::custom(format!("unrecognised date '{text}'"))),
    }
}

impl Appointment {
    /// Starts a new appointment with a generated id.
    pub fn builder(
        patient_name: impl Into<String>,
        date: DateTime<Utc>,
        time: TimeOfDay,
    ) -> AppointmentBuilder {
        AppointmentBuilder::new(RecordId::generate(), patient_name, date, time)
    }

    /// Starts an edit of this record, keeping its id.
    pub fn to_builder(&self) -> AppointmentBuilder {
        AppointmentBuilder {
            record: self.clone(),
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn patient_name(&self) -> &str {
        &self.patient_name
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn time(&self) -> TimeOfDay {
        self.time
    }

    pub fn phone(&self) -> Option<&str> {
        self.phone.as_deref()
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    /// Calendar day of the stored instant as seen from `offset`.
    pub fn local_day(&self, offset: &FixedOffset) -> NaiveDate {
        self.date.with_timezone(offset).date_naive()
    }

    /// Calendar-day equality: year, month and day must match in `offset`.
    pub fn falls_on(&self, day: NaiveDate, offset: &FixedOffset) -> bool {
        self.local_day(offset) == day
    }
}

/// Keeps the appointments that fall on `day` and orders them by time of day.
/// The sort is stable, so entries at the same time keep their stored order.
pub fn agenda_for_day(
    appointments: impl IntoIterator<Item = Appointment>,
    day: NaiveDate,
    offset: &FixedOffset,
) -> Vec<Appointment> {
    let mut agenda: Vec<Appointment> = appointments
        .into_iter()
        .filter(|appointment| appointment.falls_on(day, offset))
        .collect();
    agenda.sort_by_key(|appointment| appointment.time.sort_key());
    agenda
}

#[derive(Debug, Clone)]
pub struct AppointmentBuilder {
    record: Appointment,
}

impl AppointmentBuilder {
    pub fn new(
        id: RecordId,
        patient_name: impl Into<String>,
        date: DateTime<Utc>,
        time: TimeOfDay,
    ) -> Self {
        Self {
            record: Appointment {
                id,
                patient_name: patient_name.into(),
                date: date.trunc_subsecs(3),
                time,
                phone: None,
                notes: None,
            },
        }
    }

    pub fn patient_name(mut self, name: impl Into<String>) -> Self {
        self.record.patient_name = name.into();
        self
    }

    pub fn date(mut self, date: DateTime<Utc>) -> Self {
        self.record.date = date.trunc_subsecs(3);
        self
    }

    pub fn time(mut self, time: TimeOfDay) -> Self {
        self.record.time = time;
        self
    }

    /// Blank values clear the phone.
    pub fn phone(mut self, phone: Option<String>) -> Self {
        self.record.phone = phone.filter(|p| !p.trim().is_empty());
        self
    }

    /// Blank values clear the notes.
    pub fn notes(mut self, notes: Option<String>) -> Self {
        self.record.notes = notes.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn build(self) -> Appointment {
        self.record
    }
}
