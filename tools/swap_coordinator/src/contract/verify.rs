use alloy::primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};

use super::ContractError;

const ADDRESS_LEN: usize = 20;

/// Known-good swap creator bytecode with every trusted forwarder slot zeroed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedContract {
    pub masked_code: Bytes,
    pub forwarder_indices: Vec<usize>,
    pub trusted_forwarder: Address,
}

/// Checks deployed runtime code against the expected swap creator and returns
/// the trusted forwarder embedded in it.
pub fn check_swap_creator_code(
    code: &[u8],
    expected: &ExpectedContract,
) -> Result<Address, ContractError> {
    if code.len() != expected.masked_code.len() {
        return Err(ContractError::InvalidContract);
    }

    let mut masked = code.to_vec();
    let mut forwarder: Option<Address> = None;
    for &index in &expected.forwarder_indices {
        let end = index + ADDRESS_LEN;
        if end > code.len() {
            return Err(ContractError::InvalidContract);
        }
        let embedded = Address::from_slice(&code[index..end]);
        match forwarder {
            Some(previous) if previous != embedded => return Err(ContractError::InvalidContract),
            _ => forwarder = Some(embedded),
        }
        masked[index..end].fill(0);
    }

    if masked.as_slice() != expected.masked_code.as_ref() {
        return Err(ContractError::InvalidContract);
    }

    Ok(forwarder.unwrap_or(Address::ZERO))
}

/// Byte offsets where `forwarder` appears in `code`; used to refresh `forwarder_indices`
/// after the contract is recompiled.
pub fn find_forwarder_indices(code: &[u8], forwarder: Address) -> Vec<usize> {
    let mut found = Vec::new();
    let mut index = 0;
    while index + ADDRESS_LEN <= code.len() {
        if &code[index..index + ADDRESS_LEN] == forwarder.as_slice() {
            found.push(index);
            index += ADDRESS_LEN;
        } else {
            index += 1;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployed_with(expected: &ExpectedContract, forwarder: Address) -> Vec<u8> {
        let mut code = expected.masked_code.to_vec();
        for &index in &expected.forwarder_indices {
            code[index..index + ADDRESS_LEN].copy_from_slice(forwarder.as_slice());
        }
        code
    }

    fn expected() -> ExpectedContract {
        let mut code = vec![0x60u8; 96];
        code[10..30].fill(0);
        code[60..80].fill(0);
        ExpectedContract {
            masked_code: Bytes::from(code),
            forwarder_indices: vec![10, 60],
            trusted_forwarder: Address::repeat_byte(0x11),
        }
    }

    #[test]
    fn parses_embedded_forwarder() {
        let expected = expected();
        for forwarder in [Address::repeat_byte(0x11), Address::repeat_byte(0x42)] {
            let code = deployed_with(&expected, forwarder);
            assert_eq!(check_swap_creator_code(&code, &expected).unwrap(), forwarder);
            assert_eq!(find_forwarder_indices(&code, forwarder), vec![10, 60]);
        }
    }

    #[test]
    fn rejects_different_bytecode() {
        let expected = expected();
        let mut code = deployed_with(&expected, Address::repeat_byte(0x11));
        code[0] = 0x61;
        assert!(matches!(
            check_swap_creator_code(&code, &expected),
            Err(ContractError::InvalidContract)
        ));
        assert!(check_swap_creator_code(&code[..50], &expected).is_err());
    }

    #[test]
    fn rejects_mismatched_forwarder_slots() {
        let expected = expected();
        let mut code = deployed_with(&expected, Address::repeat_byte(0x11));
        code[60..80].copy_from_slice(Address::repeat_byte(0x22).as_slice());
        assert!(check_swap_creator_code(&code, &expected).is_err());
    }

    #[test]
    fn forwarder_slot_past_the_code_is_invalid() {
        let expected = ExpectedContract {
            masked_code: Bytes::from(vec![0u8; 30]),
            forwarder_indices: vec![20],
            trusted_forwarder: Address::ZERO,
        };
        assert!(matches!(
            check_swap_creator_code(&[0u8; 30], &expected),
            Err(ContractError::InvalidContract)
        ));
    }
}
