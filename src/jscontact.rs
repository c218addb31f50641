//! JSContact contact cards (RFC 9553)
//!
//! Sub-objects carry an optional `@type` which, when present, must name the
//! object's own type. Maps from id to object use producer-chosen string keys
//! and are kept in key order so that cards round-trip unchanged. Cards refer
//! to each other only by `uid`, never by embedding.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::patch::{self, PatchObject};

pub const JSCONTACT_VERSION: &str = "1.0";

/// Violation of a JSContact invariant
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at '{pointer}')")]
pub struct ValidationError {
    /// JSON pointer to the offending value, relative to the card
    pub pointer: String,
    pub message: String,
}

type Validation = Result<(), ValidationError>;

fn invalid(pointer: impl Into<String>, message: impl Into<String>) -> Validation {
    Err(ValidationError {
        pointer: pointer.into(),
        message: message.into(),
    })
}

fn check_type(found: Option<&str>, expected: &str, pointer: &str) -> Validation {
    match found {
        Some(t) if t != expected => invalid(
            format!("{pointer}/@type"),
            format!("expected @type '{expected}', found '{t}'"),
        ),
        _ => Ok(()),
    }
}

fn check_pref(pref: Option<u32>, pointer: &str) -> Validation {
    match pref {
        Some(p) if !(1..=100).contains(&p) => {
            invalid(format!("{pointer}/pref"), "pref must be between 1 and 100")
        }
        _ => Ok(()),
    }
}

fn check_list_as(list_as: Option<u32>, pointer: &str) -> Validation {
    match list_as {
        Some(0) => invalid(format!("{pointer}/listAs"), "listAs must be greater than 0"),
        _ => Ok(()),
    }
}

fn check_each<T>(
    map: &BTreeMap<String, T>,
    property: &str,
    check: impl Fn(&T, &str) -> Validation,
) -> Validation {
    for (id, value) in map {
        check(value, &format!("/{property}/{id}"))?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CardKind {
    Individual,
    Group,
    Org,
    Location,
    Device,
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationType {
    Acquaintance,
    Agent,
    Child,
    CoResident,
    CoWorker,
    Colleague,
    Contact,
    Crush,
    Date,
    Emergency,
    Friend,
    Kin,
    Me,
    Met,
    Muse,
    Neighbor,
    Parent,
    Sibling,
    Spouse,
    Sweetheart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GrammaticalGender {
    Animate,
    Common,
    Feminine,
    Inanimate,
    Masculine,
    Neuter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TitleKind {
    Title,
    Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhoneFeature {
    Mobile,
    Voice,
    Text,
    Video,
    MainNumber,
    Textphone,
    Fax,
    Pager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AddressComponentKind {
    Room,
    Apartment,
    Floor,
    Building,
    Number,
    Name,
    Block,
    Subdistrict,
    District,
    Locality,
    Region,
    Postcode,
    Country,
    Direction,
    Landmark,
    PostOfficeBox,
    Separator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NameComponentKind {
    Title,
    Given,
    Given2,
    Surname,
    Surname2,
    Credential,
    Generation,
    Separator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnniversaryKind {
    Birth,
    Death,
    Wedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersonalInfoKind {
    Expertise,
    Hobby,
    Interest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersonalInfoLevel {
    High,
    Medium,
    Low,
}

/// Kinds of the resource-shaped properties; which kinds a property accepts
/// depends on the property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceKind {
    Calendar,
    FreeBusy,
    Contact,
    Photo,
    Sound,
    Logo,
    Directory,
    Entry,
}

/// `Calendar`, `CryptoKey` and `Link` resources
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResourceKind>,
    #[serde(default)]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pref: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Resource {
    fn validate(&self, expected_type: &str, kinds: &[ResourceKind], pointer: &str) -> Validation {
        check_type(self.at_type.as_deref(), expected_type, pointer)?;
        check_pref(self.pref, pointer)?;
        if let Some(kind) = self.kind
            && !kinds.contains(&kind)
        {
            return invalid(format!("{pointer}/kind"), format!("kind is not valid for a {expected_type}"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryResource {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResourceKind>,
    #[serde(default)]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pref: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_as: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaResource {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ResourceKind>,
    #[serde(default)]
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pref: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_id: Option<String>,
}

/// Relation of the card to another card, keyed by that card's uid
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relation: BTreeMap<RelationType, bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameComponent {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    pub value: String,
    pub kind: NameComponentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phonetic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Name {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<NameComponent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_ordered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_separator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sort_as: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phonetic_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phonetic_system: Option<String>,
}

impl Name {
    fn validate(&self, pointer: &str) -> Validation {
        check_type(self.at_type.as_deref(), "Name", pointer)?;
        for (i, component) in self.components.iter().enumerate() {
            check_type(component.at_type.as_deref(), "NameComponent", &format!("{pointer}/components/{i}"))?;
        }
        if !self.is_ordered {
            if self.default_separator.is_some() {
                return invalid(
                    format!("{pointer}/defaultSeparator"),
                    "defaultSeparator requires isOrdered",
                );
            }
            if let Some(i) = self
                .components
                .iter()
                .position(|c| c.kind == NameComponentKind::Separator)
            {
                return invalid(
                    format!("{pointer}/components/{i}/kind"),
                    "separator components require isOrdered",
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Nickname {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pref: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgUnit {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_as: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<OrgUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_as: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pronouns {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    pub pronouns: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pref: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Title {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TitleKind>,
    /// Id of an entry of the card's `organizations`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakToAs {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grammatical_gender: Option<GrammaticalGender>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pronouns: BTreeMap<String, Pronouns>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailAddress {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    pub address: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pref: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlineService {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pref: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Phone {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    pub number: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<PhoneFeature, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pref: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguagePref {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    pub language: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pref: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulingAddress {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    #[serde(default)]
    pub uri: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pref: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressComponent {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    pub value: String,
    pub kind: AddressComponentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phonetic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<AddressComponent>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_ordered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_separator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pref: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phonetic_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phonetic_system: Option<String>,
}

impl Address {
    fn validate(&self, pointer: &str) -> Validation {
        check_type(self.at_type.as_deref(), "Address", pointer)?;
        check_pref(self.pref, pointer)?;
        for (i, component) in self.components.iter().enumerate() {
            check_type(
                component.at_type.as_deref(),
                "AddressComponent",
                &format!("{pointer}/components/{i}"),
            )?;
        }
        if !self.is_ordered {
            if self.default_separator.is_some() {
                return invalid(
                    format!("{pointer}/defaultSeparator"),
                    "defaultSeparator requires isOrdered",
                );
            }
            if let Some(i) = self
                .components
                .iter()
                .position(|c| c.kind == AddressComponentKind::Separator)
            {
                return invalid(
                    format!("{pointer}/components/{i}/kind"),
                    "separator components require isOrdered",
                );
            }
        }
        Ok(())
    }
}

/// Date of an anniversary that may lack its year, month or day
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialDate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_scale: Option<String>,
}

impl PartialDate {
    fn validate(&self, pointer: &str) -> Validation {
        if let Some(month) = self.month
            && !(1..=12).contains(&month)
        {
            return invalid(format!("{pointer}/month"), "month must be between 1 and 12");
        }
        if let Some(day) = self.day
            && !(1..=31).contains(&day)
        {
            return invalid(format!("{pointer}/day"), "day must be between 1 and 31");
        }
        if self.day.is_some() && self.month.is_none() {
            return invalid(format!("{pointer}/month"), "day requires month");
        }
        if self.month.is_some() && self.year.is_none() && self.day.is_none() {
            return invalid(format!("{pointer}/month"), "month requires year or day");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamp {
    pub utc: DateTime<Utc>,
}

/// Anniversary date, discriminated by `@type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum AnniversaryDate {
    PartialDate(PartialDate),
    Timestamp(Timestamp),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anniversary {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    pub kind: AnniversaryKind,
    pub date: AnniversaryDate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Author {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Note {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalInfo {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    pub kind: PersonalInfoKind,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<PersonalInfoLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_as: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

fn default_version() -> String {
    JSCONTACT_VERSION.to_owned()
}

/// JSContact `Card`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactCard {
    /// Server-assigned JMAP id, absent on creation
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub address_book_ids: BTreeMap<String, bool>,
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub at_type: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CardKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Uids of the members of a group card
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub members: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prod_id: Option<String>,
    /// Relations keyed by the uid of the related card
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub related_to: BTreeMap<String, Relation>,
    #[serde(default)]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<Name>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nicknames: BTreeMap<String, Nickname>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub organizations: BTreeMap<String, Organization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speak_to_as: Option<SpeakToAs>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub titles: BTreeMap<String, Title>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub emails: BTreeMap<String, EmailAddress>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub online_services: BTreeMap<String, OnlineService>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub phones: BTreeMap<String, Phone>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub preferred_languages: BTreeMap<String, LanguagePref>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub calendars: BTreeMap<String, Resource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scheduling_addresses: BTreeMap<String, SchedulingAddress>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub addresses: BTreeMap<String, Address>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub crypto_keys: BTreeMap<String, Resource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub directories: BTreeMap<String, DirectoryResource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, Resource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub media: BTreeMap<String, MediaResource>,
    /// Per-language patches of the card, keyed by language tag
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub localizations: BTreeMap<String, PatchObject>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub anniversaries: BTreeMap<String, Anniversary>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keywords: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub notes: BTreeMap<String, Note>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub personal_info: BTreeMap<String, PersonalInfo>,
}

impl ContactCard {
    /// Check every JSContact invariant, localizations included
    ///
    /// # Errors
    ///
    /// The first violation found, with a pointer into the card.
    pub fn validate(&self) -> Validation {
        self.validate_properties()?;
        for (language, localization) in &self.localizations {
            self.validate_localization(language, localization)?;
        }
        Ok(())
    }

    fn validate_properties(&self) -> Validation {
        check_type(self.at_type.as_deref(), "Card", "")?;
        if self.version.is_empty() {
            return invalid("/version", "version must not be empty");
        }
        if let Some(name) = &self.name {
            name.validate("/name")?;
        }
        check_each(&self.related_to, "relatedTo", |r, p| {
            check_type(r.at_type.as_deref(), "Relation", p)
        })?;
        check_each(&self.nicknames, "nicknames", |n, p| {
            check_type(n.at_type.as_deref(), "Nickname", p)?;
            check_pref(n.pref, p)
        })?;
        check_each(&self.organizations, "organizations", |o, p| {
            check_type(o.at_type.as_deref(), "Organization", p)?;
            for (i, unit) in o.units.iter().enumerate() {
                check_type(unit.at_type.as_deref(), "OrgUnit", &format!("{p}/units/{i}"))?;
            }
            Ok(())
        })?;
        if let Some(speak_to_as) = &self.speak_to_as {
            check_type(speak_to_as.at_type.as_deref(), "SpeakToAs", "/speakToAs")?;
            for (id, pronouns) in &speak_to_as.pronouns {
                let p = format!("/speakToAs/pronouns/{id}");
                check_type(pronouns.at_type.as_deref(), "Pronouns", &p)?;
                check_pref(pronouns.pref, &p)?;
            }
        }
        check_each(&self.titles, "titles", |t, p| {
            check_type(t.at_type.as_deref(), "Title", p)?;
            match &t.organization_id {
                Some(org) if !self.organizations.contains_key(org) => invalid(
                    format!("{p}/organizationId"),
                    "organizationId does not reference an organization of the card",
                ),
                _ => Ok(()),
            }
        })?;
        check_each(&self.emails, "emails", |e, p| {
            check_type(e.at_type.as_deref(), "EmailAddress", p)?;
            check_pref(e.pref, p)
        })?;
        check_each(&self.online_services, "onlineServices", |s, p| {
            check_type(s.at_type.as_deref(), "OnlineService", p)?;
            check_pref(s.pref, p)
        })?;
        check_each(&self.phones, "phones", |ph, p| {
            check_type(ph.at_type.as_deref(), "Phone", p)?;
            check_pref(ph.pref, p)
        })?;
        check_each(&self.preferred_languages, "preferredLanguages", |l, p| {
            check_type(l.at_type.as_deref(), "LanguagePref", p)?;
            check_pref(l.pref, p)
        })?;
        check_each(&self.calendars, "calendars", |r, p| {
            r.validate("Calendar", &[ResourceKind::Calendar, ResourceKind::FreeBusy], p)
        })?;
        check_each(&self.scheduling_addresses, "schedulingAddresses", |s, p| {
            check_type(s.at_type.as_deref(), "SchedulingAddress", p)?;
            check_pref(s.pref, p)
        })?;
        check_each(&self.addresses, "addresses", Address::validate)?;
        check_each(&self.crypto_keys, "cryptoKeys", |r, p| r.validate("CryptoKey", &[], p))?;
        check_each(&self.directories, "directories", |d, p| {
            check_type(d.at_type.as_deref(), "Directory", p)?;
            check_pref(d.pref, p)?;
            check_list_as(d.list_as, p)?;
            match d.kind {
                Some(ResourceKind::Directory | ResourceKind::Entry) | None => Ok(()),
                Some(_) => invalid(format!("{p}/kind"), "kind is not valid for a Directory"),
            }
        })?;
        check_each(&self.links, "links", |r, p| r.validate("Link", &[ResourceKind::Contact], p))?;
        check_each(&self.media, "media", |m, p| {
            check_type(m.at_type.as_deref(), "Media", p)?;
            check_pref(m.pref, p)?;
            match m.kind {
                Some(ResourceKind::Photo | ResourceKind::Sound | ResourceKind::Logo) | None => Ok(()),
                Some(_) => invalid(format!("{p}/kind"), "kind is not valid for a Media"),
            }
        })?;
        check_each(&self.anniversaries, "anniversaries", |a, p| {
            check_type(a.at_type.as_deref(), "Anniversary", p)?;
            match &a.date {
                AnniversaryDate::PartialDate(date) => date.validate(&format!("{p}/date")),
                AnniversaryDate::Timestamp(_) => Ok(()),
            }
        })?;
        check_each(&self.notes, "notes", |n, p| {
            check_type(n.at_type.as_deref(), "Note", p)?;
            match &n.author {
                Some(author) => check_type(author.at_type.as_deref(), "Author", &format!("{p}/author")),
                None => Ok(()),
            }
        })?;
        check_each(&self.personal_info, "personalInfo", |i, p| {
            check_type(i.at_type.as_deref(), "PersonalInfo", p)?;
            check_list_as(i.list_as, p)
        })?;
        Ok(())
    }

    /// A localization must be a valid patch of this card that yields a
    /// valid card, and must not patch `localizations` itself
    fn validate_localization(&self, language: &str, localization: &PatchObject) -> Validation {
        self.apply_localization(language, localization)
            .and_then(|localized| {
                localized.validate_properties().map_err(|e| ValidationError {
                    pointer: format!("/localizations/{language}{}", e.pointer),
                    message: e.message,
                })
            })
    }

    fn apply_localization(
        &self,
        language: &str,
        localization: &PatchObject,
    ) -> Result<ContactCard, ValidationError> {
        let pointer = format!("/localizations/{language}");
        let at = |message: String| ValidationError {
            pointer: pointer.clone(),
            message,
        };
        if let Some(key) = localization
            .keys()
            .find(|k| k.split('/').next() == Some("localizations"))
        {
            return Err(ValidationError {
                pointer: format!("{pointer}/{key}"),
                message: "localizations must not patch localizations".to_owned(),
            });
        }
        let mut base = self.clone();
        base.localizations.clear();
        let target = serde_json::to_value(&base).map_err(|e| {
            debug!(error = %e, "contact card does not encode");
            at("card cannot be encoded".to_owned())
        })?;
        let patched = patch::apply(&target, localization).map_err(|e| ValidationError {
            pointer: match e.key() {
                Some(key) => format!("{pointer}/{key}"),
                None => pointer.clone(),
            },
            message: e.to_string(),
        })?;
        decode_card(patched, &pointer)
    }
}

/// Parse an incoming card and check its invariants
///
/// # Errors
///
/// Decoding failures (unknown `@type` of a date, unknown enumerated values,
/// wrong value types) or invariant violations.
pub fn parse_card(value: Value) -> Result<ContactCard, ValidationError> {
    let card = decode_card(value, "")?;
    card.validate()?;
    Ok(card)
}

/// Card as read from the server with the localization for `language` applied
///
/// Works on the raw card so that values outside the enumerations this
/// module knows pass through. Returns the card unchanged when it has no
/// such localization.
///
/// # Errors
///
/// The localization is not a valid patch, patches `localizations` or does
/// not apply to the card.
pub fn localized(card: &Value, language: &str) -> Result<Value, ValidationError> {
    let Some(localization) = card.pointer(&format!("/localizations/{}", patch::escape(language))) else {
        return Ok(card.clone());
    };
    let pointer = format!("/localizations/{}", patch::escape(language));
    let localization: PatchObject = serde_json::from_value(localization.clone()).map_err(|e| {
        debug!(error = %e, "localization is not a patch object");
        ValidationError {
            pointer: pointer.clone(),
            message: "localization must be a patch object".to_owned(),
        }
    })?;
    if let Some(key) = localization
        .keys()
        .find(|k| k.split('/').next() == Some("localizations"))
    {
        return Err(ValidationError {
            pointer: format!("{pointer}/{key}"),
            message: "localizations must not patch localizations".to_owned(),
        });
    }
    let mut base = card.clone();
    if let Some(members) = base.as_object_mut() {
        members.remove("localizations");
    }
    patch::apply(&base, &localization).map_err(|e| ValidationError {
        pointer: match e.key() {
            Some(key) => format!("{pointer}/{key}"),
            None => pointer,
        },
        message: e.to_string(),
    })
}

/// Decode a card, pointing below `base` at the member that does not decode
fn decode_card(value: Value, base: &str) -> Result<ContactCard, ValidationError> {
    match serde_json::from_value(value.clone()) {
        Ok(card) => Ok(card),
        Err(e) => {
            debug!(error = %e, pointer = base, "contact card does not decode");
            let member = undecodable_member(&value).unwrap_or_default();
            Err(ValidationError {
                pointer: match (base, member.as_str()) {
                    ("", "") => "/".to_owned(),
                    (base, member) => format!("{base}{member}"),
                },
                message: "not a valid contact card".to_owned(),
            })
        }
    }
}

fn decodes(value: Value) -> bool {
    serde_json::from_value::<ContactCard>(value).is_ok()
}

/// Pointer to the first member, or entry of a member, that fails to decode alone
fn undecodable_member(card: &Value) -> Option<String> {
    let (key, member) = card
        .as_object()?
        .iter()
        .find(|(key, member)| !decodes(json!({ key.as_str(): member })))?;
    let pointer = format!("/{}", patch::escape(key));
    let entries = member
        .as_object()
        .filter(|_| decodes(json!({ key.as_str(): {} })));
    let entry = entries.and_then(|entries| {
        entries
            .iter()
            .find(|(id, entry)| !decodes(json!({ key.as_str(): { id.as_str(): entry } })))
    });
    Some(match entry {
        Some((id, _)) => format!("{pointer}/{}", patch::escape(id)),
        None => pointer,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn full_card() -> Value {
        json!({
            "@type": "Card",
            "version": "1.0",
            "uid": "urn:uuid:7e0e6d2a-1d8f-4a4e-9c5b-0a3e1f2b3c4d",
            "addressBookIds": { "b1": true },
            "kind": "individual",
            "created": "2024-03-01T09:00:00Z",
            "name": {
                "@type": "Name",
                "components": [
                    { "kind": "given", "value": "Jane" },
                    { "kind": "separator", "value": " " },
                    { "kind": "surname", "value": "Doe" }
                ],
                "isOrdered": true,
                "defaultSeparator": " ",
                "sortAs": { "surname": "Doe" }
            },
            "nicknames": { "n1": { "@type": "Nickname", "name": "JD", "pref": 1 } },
            "organizations": { "o1": { "name": "ACME", "units": [ { "name": "R&D" } ] } },
            "titles": { "t1": { "name": "Engineer", "kind": "role", "organizationId": "o1" } },
            "speakToAs": { "grammaticalGender": "feminine", "pronouns": { "p1": { "pronouns": "she/her", "pref": 1 } } },
            "emails": { "e1": { "address": "jane@example.com", "contexts": { "work": true }, "pref": 1 } },
            "phones": { "ph1": { "number": "+1-555-0100", "features": { "mobile": true, "main-number": true } } },
            "addresses": { "a1": {
                "components": [ { "kind": "locality", "value": "Springfield" }, { "kind": "postOfficeBox", "value": "12" } ],
                "countryCode": "US",
                "pref": 2
            } },
            "relatedTo": { "urn:uuid:other": { "relation": { "co-worker": true } } },
            "anniversaries": {
                "k1": { "kind": "birth", "date": { "@type": "PartialDate", "month": 4, "day": 1 } },
                "k2": { "kind": "wedding", "date": { "@type": "Timestamp", "utc": "2020-06-01T12:00:00Z" } }
            },
            "media": { "m1": { "kind": "photo", "uri": "https://example.com/jane.jpg" } },
            "directories": { "d1": { "kind": "entry", "uri": "ldap://dir/jane", "listAs": 1 } },
            "personalInfo": { "pi1": { "kind": "hobby", "value": "chess", "level": "high" } },
            "notes": { "no1": { "note": "met at conf", "author": { "name": "Bob" } } },
            "localizations": { "de": { "titles/t1/name": "Ingenieurin" } }
        })
    }

    #[test]
    fn full_card_round_trips_and_validates() {
        let card = parse_card(full_card()).expect("valid card");
        let encoded = serde_json::to_value(&card).expect("encode");
        let decoded: ContactCard = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded, card);
        assert!(matches!(
            card.anniversaries["k2"].date,
            AnniversaryDate::Timestamp(_)
        ));
    }

    #[test]
    fn unknown_anniversary_date_type_is_rejected() {
        let mut raw = full_card();
        raw["anniversaries"]["k1"]["date"]["@type"] = json!("LunarDate");
        assert!(parse_card(raw).is_err());
    }

    #[test]
    fn pref_and_list_as_bounds() {
        let mut raw = full_card();
        raw["emails"]["e1"]["pref"] = json!(101);
        let err = parse_card(raw).expect_err("pref too large");
        assert_eq!(err.pointer, "/emails/e1/pref");

        let mut raw = full_card();
        raw["personalInfo"]["pi1"]["listAs"] = json!(0);
        let err = parse_card(raw).expect_err("listAs zero");
        assert_eq!(err.pointer, "/personalInfo/pi1/listAs");
    }

    #[test]
    fn partial_date_ranges_and_dependencies() {
        let date = |year, month, day| PartialDate {
            year,
            month,
            day,
            calendar_scale: None,
        };
        assert!(date(Some(1990), Some(4), Some(1)).validate("").is_ok());
        assert!(date(Some(1990), None, None).validate("").is_ok());
        assert!(date(None, Some(4), Some(1)).validate("").is_ok());
        assert!(date(Some(1990), Some(13), None).validate("").is_err());
        assert!(date(Some(1990), Some(2), Some(32)).validate("").is_err());
        assert!(date(Some(1990), None, Some(1)).validate("").is_err());
        assert!(date(None, Some(4), None).validate("").is_err());
    }

    #[test]
    fn separators_require_ordered_names() {
        let mut raw = full_card();
        raw["name"]["isOrdered"] = json!(false);
        let err = parse_card(raw).expect_err("unordered with separator");
        assert_eq!(err.pointer, "/name/defaultSeparator");
    }

    #[test]
    fn mismatched_type_tag_is_rejected() {
        let mut raw = full_card();
        raw["emails"]["e1"]["@type"] = json!("Phone");
        let err = parse_card(raw).expect_err("wrong @type");
        assert_eq!(err.pointer, "/emails/e1/@type");
    }

    #[test]
    fn localizations_are_checked_as_patches() {
        let mut raw = full_card();
        raw["localizations"]["fr"] = json!({ "localizations/de": null });
        assert!(parse_card(raw).is_err());

        let mut raw = full_card();
        raw["localizations"]["fr"] = json!({ "emails/e1/pref": 0 });
        let err = parse_card(raw).expect_err("invalid patched value");
        assert_eq!(err.pointer, "/localizations/fr/emails/e1/pref");

        let mut raw = full_card();
        raw["localizations"]["fr"] = json!({ "name/full": "Jeanne", "name": {} });
        assert!(parse_card(raw).is_err());
    }

    #[test]
    fn localized_view_applies_the_patch() {
        let card = full_card();
        let german = localized(&card, "de").expect("localized");
        assert_eq!(german["titles"]["t1"]["name"], "Ingenieurin");
        assert!(german.get("localizations").is_none());
        assert_eq!(localized(&card, "it").expect("unchanged"), card);

        let mut raw = full_card();
        raw["localizations"]["de"] = json!({ "localizations/fr": {} });
        let err = localized(&raw, "de").expect_err("self-referencing localization");
        assert_eq!(err.pointer, "/localizations/de/localizations/fr");
    }

    #[test]
    fn decoding_errors_point_at_the_member() {
        let mut raw = full_card();
        raw["emails"]["e1"]["pref"] = json!("high");
        let err = parse_card(raw).expect_err("wrong value type");
        assert_eq!(err.pointer, "/emails/e1");
        assert_eq!(err.message, "not a valid contact card");

        let err = parse_card(json!({ "kind": 7 })).expect_err("wrong kind");
        assert_eq!(err.pointer, "/kind");

        let err = parse_card(json!([])).expect_err("not an object");
        assert_eq!(err.pointer, "/");
    }
}
