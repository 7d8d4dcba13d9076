use crate::catalog::{SchemaCatalog, DEFAULT_FUZZY_THRESHOLD};

pub(crate) const CRM_METADATA: &str = r#"{
    "Account": {
        "salesforce_name": "Account",
        "salesforce_label": "Account",
        "synonyms": ["customer", "client"],
        "important_notes_and_rules": "BillingCountry holds full country names.",
        "columns": {
            "Id": { "field_type": "id", "field_label": "Account ID", "is_nullable": false },
            "Name": { "field_type": "string", "field_label": "Account Name" },
            "Industry": { "field_type": "picklist", "field_label": "Industry" },
            "BillingCountry": {
                "field_type": "string",
                "field_label": "Billing Country",
                "synonyms": ["country"],
                "possible_values": [
                    { "value": "United States", "value_label": "United States" },
                    { "value": "Germany", "value_label": "Germany" },
                    { "value": "Japan", "value_label": "Japan" }
                ]
            },
            "OwnerId": {
                "field_type": "reference",
                "field_label": "Owner ID",
                "reference": { "refers_to": ["SalesRep"] }
            },
            "CreatedDate": { "field_type": "datetime", "field_label": "Created Date" }
        }
    },
    "Opportunity": {
        "salesforce_name": "Opportunity",
        "salesforce_label": "Opportunity",
        "synonyms": ["deal"],
        "important_notes_and_rules": "Amount is revenue once StageName is Closed Won.",
        "columns": {
            "Id": { "field_type": "id", "field_label": "Opportunity ID", "is_nullable": false },
            "Name": { "field_type": "string", "field_label": "Opportunity Name" },
            "AccountId": {
                "field_type": "reference",
                "field_label": "Account ID",
                "reference": { "refers_to": ["Account"] }
            },
            "OwnerId": {
                "field_type": "reference",
                "field_label": "Owner ID",
                "reference": { "refers_to": ["SalesRep"] }
            },
            "Amount": { "field_type": "currency", "field_label": "Amount", "synonyms": ["revenue", "sales"] },
            "StageName": { "field_type": "picklist", "field_label": "Stage" },
            "CloseDate": { "field_type": "date", "field_label": "Close Date" }
        }
    },
    "Lead": {
        "salesforce_name": "Lead",
        "salesforce_label": "Lead",
        "important_notes_and_rules": "",
        "columns": {
            "Id": { "field_type": "id", "field_label": "Lead ID", "is_nullable": false },
            "Country": {
                "field_type": "string",
                "field_label": "Country",
                "possible_values": [
                    { "value": "United States", "value_label": "United States" },
                    { "value": "Germany", "value_label": "Germany" }
                ]
            },
            "IsConverted": { "field_type": "boolean", "field_label": "Converted", "synonyms": ["conversion"] },
            "ConvertedAccountId": { "field_type": "reference", "field_label": "Converted Account ID" },
            "OwnerId": {
                "field_type": "reference",
                "field_label": "Owner ID",
                "reference": { "refers_to": ["SalesRep"] }
            },
            "CreatedDate": { "field_type": "datetime", "field_label": "Created Date" }
        }
    },
    "SalesRep": {
        "salesforce_name": "User",
        "salesforce_label": "User",
        "synonyms": ["rep", "owner"],
        "important_notes_and_rules": "",
        "columns": {
            "Id": { "field_type": "id", "field_label": "User ID", "is_nullable": false },
            "Name": { "field_type": "string", "field_label": "Full Name" },
            "Region": { "field_type": "picklist", "field_label": "Region" }
        }
    }
}"#;

pub(crate) fn crm_catalog() -> SchemaCatalog {
    SchemaCatalog::from_json(CRM_METADATA, DEFAULT_FUZZY_THRESHOLD).expect("fixture metadata parses")
}
