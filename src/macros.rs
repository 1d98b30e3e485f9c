macro_rules! uuid_based_wrapper_type {
    (
        $(#[$documentation:meta])*
        $struct_name:ident
    ) => {
        $(#[$documentation])*
        #[derive(
            Debug,
            Copy,
            Clone,
            serde::Deserialize,
            serde::Serialize,
            Hash,
            Ord,
            PartialOrd,
            Eq,
            PartialEq,
        )]
        #[serde(transparent)]
        pub struct $struct_name(uuid::Uuid);

        impl std::fmt::Display for $struct_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$struct_name> for uuid::Uuid {
            fn from(id: $struct_name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $struct_name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }
        }

        impl $struct_name {
            pub(crate) fn new() -> Self {
                $struct_name(uuid::Uuid::new_v4())
            }
        }
    };
}
