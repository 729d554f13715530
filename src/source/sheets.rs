//! The legacy export's sheets and the columns the phases read from them.
//!
//! Column names are stored in [`column_key`](super::column_key) form.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetSpec {
    pub name: &'static str,
    /// CSV file name inside the export directory.
    pub file_name: &'static str,
    pub id_column: &'static str,
    /// Path segment of the remote API resource.
    pub resource: &'static str,
}

pub const COMPANIES: SheetSpec = SheetSpec {
    name: "companies",
    file_name: "Companies.csv",
    id_column: "id_company",
    resource: "companies",
};

pub const REFERRERS: SheetSpec = SheetSpec {
    name: "referrers",
    file_name: "Referrers.csv",
    id_column: "id_referrer",
    resource: "referrers",
};

pub const PATIENTS: SheetSpec = SheetSpec {
    name: "patients",
    file_name: "Patients.csv",
    id_column: "id_contact",
    resource: "contacts",
};

pub const COMMUNICATIONS: SheetSpec = SheetSpec {
    name: "communications",
    file_name: "Communications.csv",
    id_column: "id",
    resource: "communications",
};

pub const REFERRALS: SheetSpec = SheetSpec {
    name: "referrals",
    file_name: "Referrals.csv",
    id_column: "id",
    resource: "referrals",
};

pub const DOCUMENTS: SheetSpec = SheetSpec {
    name: "documents",
    file_name: "Documents.csv",
    id_column: "id",
    resource: "documents",
};

pub const IMAGES: SheetSpec = SheetSpec {
    name: "images",
    file_name: "Images.csv",
    id_column: "id",
    resource: "images",
};

pub const ALL: [&SheetSpec; 7] = [
    &COMPANIES,
    &REFERRERS,
    &PATIENTS,
    &COMMUNICATIONS,
    &REFERRALS,
    &DOCUMENTS,
    &IMAGES,
];

pub fn by_name(name: &str) -> Option<&'static SheetSpec> {
    ALL.into_iter().find(|s| s.name == name)
}

pub mod companies {
    pub const NAME: &str = "name";
    pub const ABN: &str = "abn";
    pub const PHONES: [&str; 3] = ["phone", "phone_2", "fax"];
    pub const EMAIL: &str = "email";
    pub const NOTES: &str = "notes";
}

pub mod referrers {
    pub const COMPANY_ID: &str = "id_company";
    pub const TITLE: &str = "title";
    pub const FIRST_NAME: &str = "first_name";
    pub const LAST_NAME: &str = "last_name";
    pub const SPECIALTY: &str = "specialty";
    pub const PROVIDER_NUMBER: &str = "provider_number";
    pub const PHONES: [&str; 3] = ["phone", "mobile", "fax"];
    pub const EMAIL: &str = "email";
    pub const NOTES: &str = "notes";
    pub const COMPANY_SINCE: &str = "company_start_date";
}

pub mod patients {
    pub const TITLE: &str = "title";
    pub const FIRST_NAME: &str = "first_name";
    pub const LAST_NAME: &str = "last_name";
    pub const PREFERRED_NAME: &str = "preferred_name";
    pub const DOB: &str = "dob";
    pub const GENDER: &str = "gender";
    pub const PHONES: [&str; 3] = ["phone_home", "phone_mobile", "phone_work"];
    pub const EMAIL: &str = "email";
    pub const NOTES: [&str; 2] = ["notes", "medical_notes"];
    pub const ACTIVE: &str = "active";

    pub const COORDINATOR_FIRST_NAME: &str = "coordinator_first_name";
    pub const COORDINATOR_LAST_NAME: &str = "coordinator_last_name";
    pub const COORDINATOR_ORGANISATION: &str = "coordinator_organisation";
    pub const COORDINATOR_PHONES: [&str; 2] = ["coordinator_phone", "coordinator_mobile"];
    pub const COORDINATOR_EMAIL: &str = "coordinator_email";
    pub const COORDINATOR_NOTES: &str = "coordinator_notes";
    pub const COORDINATOR_START_DATE: &str = "coordinator_start_date";
    pub const COORDINATOR_ACTIVE: &str = "coordinator_active";
}

/// Columns shared by the address block of patients and companies.
pub mod address {
    pub const LINE1: &str = "address_1";
    pub const LINE2: &str = "address_2";
    pub const SUBURB: &str = "suburb";
    pub const STATE: &str = "state";
    pub const POSTCODE: &str = "postcode";
}

pub mod communications {
    pub const PATIENT_ID: &str = "id_contact";
    pub const CHANNEL: &str = "type";
    pub const DATE: &str = "date";
    pub const SUBJECT: &str = "subject";
    pub const BODY: &str = "notes";
    pub const STAFF: &str = "staff";
}

pub mod referrals {
    pub const PATIENT_ID: &str = "id_contact";
    pub const REFERRER_ID: &str = "id_referrer";
    pub const DATE: &str = "referral_date";
    pub const ACTIVE: &str = "active";
    pub const REASON: &str = "reason";
}

pub mod attachments {
    pub const PATIENT_ID: &str = "id_contact";
    pub const FILE_NAME: &str = "file_name";
}
