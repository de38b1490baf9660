/// Credential selection for talking to the AI project.
///
/// Token acquisition belongs to the platform SDK; this module only decides
/// which credential flavour the host should use and names it for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    /// Running inside a managed-identity host (`MSI_ENDPOINT` is set).
    ManagedIdentity,
    /// Local development with an `az login` session.
    AzureCli,
    /// Environment, workload identity, CLI, and friends, tried in order.
    DefaultChain,
}

impl Credential {
    /// Managed identity wins whenever the host advertises it.
    pub fn select(has_msi: bool, use_azure_cli: bool) -> Self {
        if has_msi {
            Credential::ManagedIdentity
        } else if use_azure_cli {
            Credential::AzureCli
        } else {
            Credential::DefaultChain
        }
    }

    /// SDK type name, as it shows up in platform diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Credential::ManagedIdentity => "ManagedIdentityCredential",
            Credential::AzureCli => "AzureCliCredential",
            Credential::DefaultChain => "DefaultAzureCredential",
        }
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msi_wins_over_cli_flag() {
        assert_eq!(Credential::select(true, true), Credential::ManagedIdentity);
        assert_eq!(Credential::select(true, false), Credential::ManagedIdentity);
    }

    #[test]
    fn test_cli_when_requested_locally() {
        assert_eq!(Credential::select(false, true), Credential::AzureCli);
    }

    #[test]
    fn test_default_chain_otherwise() {
        let cred = Credential::select(false, false);
        assert_eq!(cred, Credential::DefaultChain);
        assert_eq!(cred.to_string(), "DefaultAzureCredential");
    }
}
