//! Endpoint paths and custom-representation strings for the EMR REST API.
//!
//! Reads use "custom representation" query strings that declaratively select
//! which nested fields a fetch returns per entity type. These strings are a
//! fixed contract with the server: verification depends on fetching exactly
//! the same shape from both sides, so they must not drift between export and
//! verify.

/// Global properties adjusted on the target server for the duration of a
/// bulk patient import.
pub mod properties {
    /// One property and the values it holds during and after a bulk run.
    #[derive(Clone, Copy, Debug)]
    pub struct PropertyToggle {
        pub name: &'static str,
        pub during: &'static str,
        pub after: &'static str,
    }

    /// Stops the server from re-assigning encounters to visits on save.
    pub const VISIT_ASSIGNMENT_HANDLER_DISABLED: &str =
        "emrapi.emrApiVisitAssignmentHandler.disabled";
    /// Lets the import supply order numbers instead of the server sequence.
    pub const ALLOW_SETTING_ORDER_NUMBER: &str = "order.allowSettingOrderNumber";
    /// Keeps the server from auto-expiring orders that arrive already inactive.
    pub const IGNORE_ATTEMPTS_TO_STOP_INACTIVE_ORDERS: &str =
        "order.ignoreAttemptsToStopInactiveOrders";
    /// Result-size cap on REST queries; verification refetches whole
    /// patient histories in one request.
    pub const REST_MAX_RESULTS_ABSOLUTE: &str = "webservices.rest.maxResultsAbsolute";

    /// The full set applied around a bulk patient import.
    pub const BULK_IMPORT_SET: &[PropertyToggle] = &[
        PropertyToggle {
            name: VISIT_ASSIGNMENT_HANDLER_DISABLED,
            during: "true",
            after: "false",
        },
        PropertyToggle {
            name: ALLOW_SETTING_ORDER_NUMBER,
            during: "true",
            after: "false",
        },
        PropertyToggle {
            name: IGNORE_ATTEMPTS_TO_STOP_INACTIVE_ORDERS,
            during: "true",
            after: "false",
        },
        PropertyToggle {
            name: REST_MAX_RESULTS_ABSOLUTE,
            during: "100000",
            after: "1000",
        },
    ];
}

/// Order type uuids used to partition the order export.
pub mod order_types {
    pub const DRUG_ORDER: &str = "131168f4-15f5-102d-96e4-000c29c2a5d7";
    pub const TEST_ORDER: &str = "52a447d3-a64a-11e3-9aeb-50e549534c5e";
    pub const PATHOLOGY_TEST_ORDER: &str = "8189b409-3f10-11e4-adec-0800271c1b75";
}

/// Concept holding a test's order number as an obs value; the order-number
/// prefix must be applied here as well as on the orders themselves.
pub const TEST_ORDER_NUMBER_CONCEPT: &str = "393dec41-2fb5-428f-acfa-36ea85da6666";

const PERSON_REP: &str = "(uuid,gender,birthdate,birthdateEstimated,dead,deathDate,causeOfDeath,dateCreated,creator:(uuid),names:(uuid,preferred,prefix,givenName,familyName,familyName2,familyNamePrefix,familyNameSuffix,middleName,degree,dateCreated,creator:(uuid)),addresses:(preferred,address1,address2,address3,address4,address5,address6,cityVillage,stateProvince,postalCode,countyDistrict,country,latitude,longitude,startDate,endDate,dateCreated,creator:(uuid)),attributes:(uuid,value,attributeType:(uuid),dateCreated,creator:(uuid)))";

const OBS_BASE_REP: &str = "(uuid,concept:(uuid),person:(uuid),obsDatetime,location:(uuid),encounter:(uuid),comment,accessionNumber,formNamespaceAndPath,status,valueModifier,valueCodedName:(uuid),value:(uuid),dateCreated,creator:(uuid),GROUP_MEMBERS)";

const ORDER_BASE_REP: &str = "(uuid,orderNumber,accessionNumber,patient:(uuid),concept:(uuid),action,careSetting:(uuid),previousOrder:(uuid),dateActivated,scheduledDate,dateStopped,autoExpireDate,encounter:(uuid),orderer:(uuid),orderReason:(uuid),orderReasonNonCoded,urgency,instructions,commentToFulfiller,dateCreated,creator:(uuid)";

/// Obs representation with group members nested two levels deep. The API
/// cannot express unbounded recursion in a representation string, and two
/// levels covers every form in use.
fn obs_rep() -> String {
    let mut rep = OBS_BASE_REP.to_string();
    rep = rep.replace("GROUP_MEMBERS", &format!("groupMembers:{OBS_BASE_REP}"));
    rep = rep.replace("GROUP_MEMBERS", &format!("groupMembers:{OBS_BASE_REP}"));
    rep.replace(",GROUP_MEMBERS", "")
}

fn patient_rep() -> String {
    format!(
        "v=custom:(uuid,display,allergyStatus,identifiers:(uuid,identifier,identifierType:(uuid),preferred,dateCreated,creator:(uuid)),dateCreated,creator:(uuid),person:{PERSON_REP})"
    )
}

fn visit_rep() -> String {
    "v=custom:(uuid,patient:(uuid),attributes:(uuid,value,attributeType:(uuid),dateCreated,creator:(uuid)),startDatetime,stopDatetime,indication:(uuid),location:(uuid),visitType:(uuid),dateCreated,creator:(uuid))".to_string()
}

fn encounter_rep() -> String {
    format!(
        "v=custom:(uuid,patient:(uuid),location:(uuid),encounterType:(uuid),form:(uuid),visit:(uuid),encounterDatetime,encounterProviders:(provider:(uuid),encounterRole:(uuid),dateCreated,creator:(uuid)),dateCreated,creator:(uuid),obs:{})",
        obs_rep()
    )
}

fn obs_custom_rep() -> String {
    format!("v=custom:{}", obs_rep())
}

fn test_order_rep() -> String {
    format!("v=custom:{ORDER_BASE_REP},specimenSource:(uuid),laterality,clinicalHistory,numberOfRepeats,frequency:(uuid))")
}

fn drug_order_rep() -> String {
    format!("v=custom:{ORDER_BASE_REP},drug:(uuid),dosingType,dose,doseUnits:(uuid),frequency:(uuid),asNeeded,asNeededCondition,quantity,quantityUnits:(uuid),numRefills,dosingInstructions,duration,durationUnits:(uuid),route:(uuid),brandName,dispenseAsWritten,drugNonCoded)")
}

fn user_rep() -> String {
    format!(
        "v=custom:(uuid,username,email,userProperties,roles:(uuid),person:{PERSON_REP},dateCreated,creator:(uuid))"
    )
}

fn provider_rep() -> String {
    format!(
        "v=custom:(uuid,identifier,providerRole:(uuid),dateCreated,creator:(uuid),person:{PERSON_REP})"
    )
}

fn program_enrollment_rep() -> String {
    "v=custom:(uuid,patient:(uuid),program:(uuid),location:(uuid),dateEnrolled,dateCompleted,outcome:(uuid),dateCreated,creator:(uuid),states:(uuid,startDate,endDate,dateCreated,creator:(uuid),state:(uuid)))".to_string()
}

fn allergy_rep() -> String {
    "v=custom:(uuid,allergen:(allergenType,codedAllergen:(uuid),nonCodedAllergen),severity:(uuid),comment,reactions:(reaction:(uuid),reactionNonCoded),dateCreated,creator:(uuid))".to_string()
}

fn relationship_rep() -> String {
    format!(
        "v=custom:(uuid,relationshipType:(uuid),startDate,endDate,dateCreated,creator:(uuid),personA:{PERSON_REP},personB:{PERSON_REP})"
    )
}

/// URL builder for one server's REST API.
#[derive(Clone, Debug)]
pub struct Catalog {
    base: String,
}

impl Catalog {
    pub fn new(base_url: &str) -> Self {
        Self {
            base: format!("{}/ws/rest/v1", base_url.trim_end_matches('/')),
        }
    }

    // collection endpoints (POST targets for conditional create)

    pub fn patients(&self) -> String {
        format!("{}/patient", self.base)
    }

    pub fn persons(&self) -> String {
        format!("{}/person", self.base)
    }

    pub fn visits(&self) -> String {
        format!("{}/visit", self.base)
    }

    pub fn encounters(&self) -> String {
        format!("{}/encounter", self.base)
    }

    pub fn obs(&self) -> String {
        format!("{}/obs", self.base)
    }

    pub fn orders(&self) -> String {
        format!("{}/order", self.base)
    }

    pub fn users(&self) -> String {
        format!("{}/user", self.base)
    }

    pub fn providers(&self) -> String {
        format!("{}/providermanagement/provider", self.base)
    }

    pub fn program_enrollments(&self) -> String {
        format!("{}/programenrollment", self.base)
    }

    pub fn relationships(&self) -> String {
        format!("{}/relationship", self.base)
    }

    pub fn system_property(&self, name: &str) -> String {
        format!("{}/systemsetting/{name}", self.base)
    }

    // export fetch URLs, with the representation applied

    pub fn patient_export(&self, uuid: &str) -> String {
        format!("{}/{uuid}?{}", self.patients(), patient_rep())
    }

    pub fn visits_export(&self, patient_uuid: &str) -> String {
        format!("{}?patient={patient_uuid}&{}", self.visits(), visit_rep())
    }

    pub fn encounters_export(&self, patient_uuid: &str) -> String {
        format!(
            "{}?patient={patient_uuid}&s=default&{}",
            self.encounters(),
            encounter_rep()
        )
    }

    pub fn obs_export(&self, patient_uuid: &str) -> String {
        format!("{}?patient={patient_uuid}&{}", self.obs(), obs_custom_rep())
    }

    pub fn test_orders_export(&self, patient_uuid: &str) -> String {
        format!(
            "{}?orderTypes={},{}&patient={patient_uuid}&{}",
            self.orders(),
            order_types::TEST_ORDER,
            order_types::PATHOLOGY_TEST_ORDER,
            test_order_rep()
        )
    }

    pub fn drug_orders_export(&self, patient_uuid: &str) -> String {
        format!(
            "{}?orderTypes={}&patient={patient_uuid}&{}",
            self.orders(),
            order_types::DRUG_ORDER,
            drug_order_rep()
        )
    }

    pub fn program_enrollments_export(&self, patient_uuid: &str) -> String {
        format!(
            "{}?patient={patient_uuid}&voided=false&{}",
            self.program_enrollments(),
            program_enrollment_rep()
        )
    }

    pub fn allergies_export(&self, patient_uuid: &str) -> String {
        format!("{}/{patient_uuid}/allergy?{}", self.patients(), allergy_rep())
    }

    pub fn user_export(&self, uuid: &str) -> String {
        format!("{}/{uuid}?{}", self.users(), user_rep())
    }

    pub fn provider_export(&self, uuid: &str) -> String {
        format!("{}/{uuid}?{}", self.providers(), provider_rep())
    }

    pub fn person_export(&self, uuid: &str) -> String {
        format!("{}/{uuid}?v=custom:{PERSON_REP}", self.persons())
    }

    pub fn relationship_export(&self, uuid: &str) -> String {
        format!("{}/{uuid}?{}", self.relationships(), relationship_rep())
    }
}
