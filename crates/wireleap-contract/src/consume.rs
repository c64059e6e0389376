//! Typed accessors for the individual contract resources.

use url::Url;
use wireleap_relay::{ContractInfo, DirectoryInfo, RelayList};
use wireleap_sharetoken::{SkActivationRequest, SkContract};

use crate::{ApiClient, Error};

/// Join `path` onto a contract endpoint.
fn endpoint(contract: &Url, path: &str) -> Url {
    // Contract endpoints have no trailing slash; Url::join would eat the
    // last path segment, so splice the path in by hand.
    let mut u = contract.clone();
    u.set_path(&format!("{}{}", contract.path().trim_end_matches('/'), path));
    u
}

/// Fetch `GET <contract>/info`.
pub async fn contract_info(cl: &ApiClient, contract: &Url) -> Result<ContractInfo, Error> {
    cl.get_json(&endpoint(contract, "/info")).await
}

/// Fetch `GET <contract>/directory`.
pub async fn directory_info(cl: &ApiClient, contract: &Url) -> Result<DirectoryInfo, Error> {
    cl.get_json(&endpoint(contract, "/directory")).await
}

/// Fetch `GET <contract>/relays`.
pub async fn relays(cl: &ApiClient, contract: &Url) -> Result<RelayList, Error> {
    cl.get_json(&endpoint(contract, "/relays")).await
}

/// Activate a servicekey: `POST <contract>/servicekey/activate`.
///
/// On success the contract returns the binding to attach to the key.  A
/// replayed pof comes back as a 409 `Status`, surfaced here as
/// [`Error::Status`].
pub async fn activate_sk(
    cl: &ApiClient,
    contract: &Url,
    req: &SkActivationRequest,
) -> Result<SkContract, Error> {
    cl.post_json(&endpoint(contract, "/servicekey/activate"), req)
        .await
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn endpoint_join() {
        let base: Url = "https://contract.example.com".parse().unwrap();
        assert_eq!(
            endpoint(&base, "/servicekey/activate").as_str(),
            "https://contract.example.com/servicekey/activate"
        );
        let with_path: Url = "https://example.com/contract/".parse().unwrap();
        assert_eq!(
            endpoint(&with_path, "/info").as_str(),
            "https://example.com/contract/info"
        );
    }
}
